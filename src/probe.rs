//! Connectivity probe: is the backend up, and does it know about our model?
use crate::client::HttpClient;
use crate::config::ConfigProfile;
use crate::error::PoolError;
use crate::models::{ListModelResponse, is_listed_variant};
use crate::pool::ConnectionPool;
use std::sync::Arc;
use tracing::{error, info, warn};

pub(crate) const TAGS_PATH: &str = "/api/tags";

/// Issues a single read-only listing request. It never retries; callers that want retries wrap
/// it themselves.
#[derive(Debug)]
pub struct ConnectivityProber<C: HttpClient> {
    profile: Arc<ConfigProfile>,
    pool: Arc<ConnectionPool<C>>,
}

impl<C: HttpClient> ConnectivityProber<C> {
    pub fn new(profile: Arc<ConfigProfile>, pool: Arc<ConnectionPool<C>>) -> Self {
        Self { profile, pool }
    }

    /// Returns `Ok(true)` if the backend answered and lists the configured model.
    ///
    /// Transport failures, error statuses, unreadable listings and a missing model are all
    /// `Ok(false)`. `Err` means the probe could not even be attempted.
    pub async fn verify(&self) -> Result<bool, PoolError> {
        self.probe(true, None).await
    }

    /// [`verify`](Self::verify) that fails with [`PoolError::Released`] instead of reopening a
    /// pool released past `generation`.
    pub(crate) async fn verify_in(&self, generation: u64) -> Result<bool, PoolError> {
        self.probe(true, Some(generation)).await
    }

    /// Like [`verify`](Self::verify) but only checks that the backend answers.
    pub async fn verify_reachable(&self) -> Result<bool, PoolError> {
        self.probe(false, None).await
    }

    async fn probe(&self, check_model: bool, generation: Option<u64>) -> Result<bool, PoolError> {
        let client = match generation {
            Some(generation) => self.pool.acquire_in(generation).await?,
            None => self.pool.acquire().await?,
        };
        let url = self.profile.endpoint(TAGS_PATH);
        let model = self.profile.model_id();

        info!(base_address = %self.profile.base_address(), "Verifying connection to backend");

        let response = match client.get(&url, self.profile.timeouts().total).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Error verifying connection to backend");
                return Ok(false);
            }
        };

        if !response.is_success() {
            error!(status = %response.status, "Failed to connect to backend");
            return Ok(false);
        }

        if check_model {
            let listing: ListModelResponse = match response.json() {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(error = %e, "Could not parse model listing");
                    return Ok(false);
                }
            };

            let available = listing.names();
            info!(models = ?available, "Available models on backend");

            if !available.iter().any(|listed| is_listed_variant(listed, model)) {
                warn!(
                    model = %model,
                    available = ?available,
                    "Model not found on backend; pull it before use"
                );
                return Ok(false);
            }
        }

        info!(model = %model, "Successfully verified connection to backend");
        Ok(true)
    }
}
