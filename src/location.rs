use async_trait::async_trait;
use callcore::types::Location;

/// Source of the user's position for proximity matching.
///
/// The controller bounds every lookup by `ClientConfig::location_timeout`
/// and treats a failure as "no location".
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> anyhow::Result<Location>;
}

/// Always reports that no position is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current_location(&self) -> anyhow::Result<Location> {
        Err(anyhow::anyhow!("location is not available on this device"))
    }
}

/// A fixed position, e.g. from command-line flags.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Location);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> anyhow::Result<Location> {
        Ok(self.0)
    }
}
