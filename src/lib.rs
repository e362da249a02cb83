pub mod client;
pub mod config;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod server_connection;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
