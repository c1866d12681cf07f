//! Reference federated client: a linear-regression Local Trainer served over HTTP.

pub mod linear;
pub mod runner;
pub mod server;

pub use linear::{LinearRegressionTrainer, PartitionSpec, SyntheticPartition};
pub use runner::{run_client, run_client_until, ClientExit, ClientOptions};
pub use server::{router, ClientState};
