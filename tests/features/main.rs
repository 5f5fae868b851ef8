//! Client behaviour scenarios using Cucumber.
//!
//! Every scenario runs against a fresh in-memory cluster:
//!
//! ```bash
//! cargo test --test features --features test-utils
//! ```

mod steps;

use cucumber::World;
use steps::ClientWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running Client Scenarios ===\n");
    // Runs every .feature file in the directory; any failed or skipped
    // step fails the test binary.
    ClientWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/features")
        .await;
}
