use relay_sdk::error::StoreError;
use relay_sdk::store_trait::WalletService;

/// Wallet RPC internals are explicitly out of scope; this logs the call a
/// real wallet integration would receive and always reports healthy.
#[derive(Default)]
pub struct LoggingWalletService;

impl LoggingWalletService {
    pub fn new() -> Self {
        Self
    }
}

impl WalletService for LoggingWalletService {
    fn request_addresses(&self, count: u64) -> Result<(), StoreError> {
        log::info!("wallet: requesting {count} new addresses");
        Ok(())
    }

    fn health(&self) -> Result<bool, StoreError> {
        Ok(true)
    }
}
