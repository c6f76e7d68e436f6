use std::{fs::File, io::Read};

use anyhow::{bail, Context, Result};
use braille_rs::BrailleChar;
use nalgebra::DMatrix;

pub const IMAGE_SIDE: usize = 28;
pub const PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;

/// The four MNIST IDX files parsed into sample matrices (one image per
/// row, pixels scaled to [0, 1]) and integer label vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct Mnist {
    pub training_images: DMatrix<f64>,
    pub training_labels: Vec<usize>,
    pub test_images: DMatrix<f64>,
    pub test_labels: Vec<usize>,
}

pub fn read(path: impl ToString) -> Result<Mnist> {
    let path = path.to_string();
    let open = |name: &str| {
        File::open(path.clone() + name).with_context(|| format!("opening {path}{name}"))
    };

    Ok(Mnist {
        test_images: parse_images(open("t10k-images-idx3-ubyte")?)?,
        test_labels: parse_labels(open("t10k-labels-idx1-ubyte")?)?,
        training_images: parse_images(open("train-images-idx3-ubyte")?)?,
        training_labels: parse_labels(open("train-labels-idx1-ubyte")?)?,
    })
}

fn parse_labels(mut handle: File) -> Result<Vec<usize>> {
    read_header(&mut handle, 1)?;

    // item count, already implied by the payload length
    let mut tmp = [0u8; 4];
    handle.read_exact(&mut tmp)?;

    let mut raw = Vec::new();
    handle.read_to_end(&mut raw)?;

    Ok(raw.into_iter().map(usize::from).collect())
}

fn parse_images(mut handle: File) -> Result<DMatrix<f64>> {
    read_header(&mut handle, 3)?;

    // item count plus the two image dimensions
    let mut tmp = [0u8; 3 * 4];
    handle.read_exact(&mut tmp)?;

    let mut raw = Vec::new();
    handle.read_to_end(&mut raw)?;

    if raw.len() % PIXELS != 0 {
        bail!("image payload is not a whole number of {IMAGE_SIDE}x{IMAGE_SIDE} images");
    }

    let floats: Vec<f64> = raw.into_iter().map(|byte| byte as f64 / 255.).collect();

    Ok(DMatrix::from_row_slice(
        floats.len() / PIXELS,
        PIXELS,
        &floats,
    ))
}

fn read_header(handle: &mut File, dims: u8) -> Result<()> {
    let mut header = [0u8; 4];
    handle.read_exact(&mut header)?;

    match header {
        [0, 0, 8, d] if d == dims => Ok(()),
        _ => bail!("bad idx header {header:?}, expected [0, 0, 8, {dims}]"),
    }
}

/// Draw one 28x28 image as braille, four pixel rows per text line.
pub fn render(pixels: &[f64], threshold: f64) -> String {
    let mut canvas = String::new();

    let grid: Vec<bool> = pixels.iter().map(|p| *p >= threshold).collect();

    for band in grid.chunks_exact(IMAGE_SIDE * 4) {
        for cell in 0..IMAGE_SIDE / 2 {
            let col = 2 * cell;
            let byte = (band[col] as u8)
                | ((band[IMAGE_SIDE + col] as u8) << 1)
                | ((band[IMAGE_SIDE * 2 + col] as u8) << 2)
                | ((band[IMAGE_SIDE * 3 + col] as u8) << 3)
                | ((band[col + 1] as u8) << 4)
                | ((band[IMAGE_SIDE + col + 1] as u8) << 5)
                | ((band[IMAGE_SIDE * 2 + col + 1] as u8) << 6)
                | ((band[IMAGE_SIDE * 3 + col + 1] as u8) << 7);

            canvas.push(BrailleChar::with_data(byte).into());
        }
        canvas.push('\n');
    }

    canvas
}
