use anyhow::Result;
use rand::{rngs::StdRng, SeedableRng};

use mnist_mlp::{mnist, Network, NetworkConfig};

fn main() -> Result<()> {
    let data = mnist::read("data/")?;

    let first: Vec<f64> = data.test_images.row(0).iter().copied().collect();
    println!("[{}]:\n{}", data.test_labels[0], mnist::render(&first, 0.5));

    let config = NetworkConfig {
        n_hidden: 50,
        l2: 0.1,
        epochs: 30,
        learning_rate: 0.001,
        decay_rate: 0.00001,
        minibatches: 50,
        ..NetworkConfig::new(10, mnist::PIXELS)
    };

    let mut network = Network::new(config, &mut StdRng::seed_from_u64(0xF00D))?;
    network.fit(&data.training_images, &data.training_labels, true)?;

    println!(
        "test accuracy: {:#.3}%",
        network.accuracy(&data.test_images, &data.test_labels)
    );

    Ok(())
}
