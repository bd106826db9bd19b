use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Answers "is the internet reachable right now". Must return quickly;
/// errors and timeouts count as offline.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

pub struct HttpProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        HttpProbe {
            client: Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        // Any HTTP answer, even an error status, proves the network path works.
        match self.client.head(&self.url).timeout(self.timeout).send().await {
            Ok(response) => {
                debug!(status = %response.status(), url = %self.url, "Reachability probe answered");
                true
            }
            Err(e) => {
                debug!(error = %e, url = %self.url, "Reachability probe failed");
                false
            }
        }
    }
}
