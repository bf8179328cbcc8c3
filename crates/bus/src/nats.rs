//! The NATS transport. Requests are single JSON messages with the transport's
//! reply subject; each instance's daemon holds one wildcard subscription.

use std::sync::Arc;

use anyhow::Result;
use async_nats::RequestErrorKind;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_core::{InstanceId, Platform, PlatformError, PlatformResult};

use crate::dispatch::dispatch;
use crate::protocol::*;
use crate::{MessageBus, DEFAULT_TIMEOUT, MAX_AGE};

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the NATS server; the client reconnects indefinitely on its
    /// own once established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await?;
        info!(url, "connected to NATS");
        Ok(NatsBus { client })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn connect(&self, instance: &InstanceId) -> PlatformResult<Arc<dyn Platform>> {
        Ok(Arc::new(NatsPlatform { client: self.client.clone(), instance: instance.clone() }))
    }

    async fn subscribe(
        &self,
        instance: &InstanceId,
        platform: Arc<dyn Platform>,
        done: mpsc::Sender<Option<PlatformError>>,
    ) {
        let mut sub = match self.client.subscribe(wildcard(instance)).await {
            Ok(sub) => sub,
            Err(err) => {
                let _ = done.send(Some(PlatformError::Unavailable(err.to_string()))).await;
                return;
            }
        };

        // More than one daemon may try to serve an instance. On arrival we
        // announce a kick with a fresh id; every other subscriber recognises
        // a foreign id and exits, leaving at most one of us.
        let my_id = Uuid::new_v4().to_string();
        if let Err(err) =
            self.client.publish(subject(instance, METHOD_KICK), my_id.clone().into()).await
        {
            let _ = done.send(Some(PlatformError::Unavailable(err.to_string()))).await;
            return;
        }

        let client = self.client.clone();
        let instance = instance.clone();
        tokio::spawn(async move {
            // Capacity one and non-blocking sends: the first fatal error wins
            // and later ones are dropped on the floor.
            let (errc_tx, mut errc_rx) = mpsc::channel::<PlatformError>(1);
            let age_out = tokio::time::sleep(MAX_AGE);
            tokio::pin!(age_out);

            loop {
                tokio::select! {
                    Some(err) = errc_rx.recv() => {
                        let _ = sub.unsubscribe().await;
                        warn!(instance = %instance, error = %err, "subscription ended");
                        let _ = done.send(Some(err)).await;
                        return;
                    }
                    message = sub.next() => {
                        let Some(message) = message else {
                            let _ = done
                                .send(Some(PlatformError::Unavailable(
                                    "subscription stream closed".to_string(),
                                )))
                                .await;
                            return;
                        };
                        // Some methods block for a long while; handle each
                        // request on its own task so pings keep flowing, and
                        // deliver any fatal error back here for cleanup.
                        let platform = platform.clone();
                        let client = client.clone();
                        let errc = errc_tx.clone();
                        let my_id = my_id.clone();
                        tokio::spawn(async move {
                            let outcome = dispatch(
                                platform.as_ref(),
                                &my_id,
                                message.subject.as_str(),
                                &message.payload,
                            )
                            .await;
                            if let (Some(reply), Some(reply_to)) =
                                (outcome.reply, message.reply.clone())
                            {
                                let _ = client.publish(reply_to, reply.into()).await;
                            }
                            if let Some(fatal) = outcome.fatal {
                                let _ = errc.try_send(fatal);
                            }
                        });
                    }
                    _ = &mut age_out => {
                        let _ = sub.unsubscribe().await;
                        debug!(instance = %instance, "subscription aged out");
                        let _ = done.send(None).await;
                        return;
                    }
                }
            }
        });
    }

    async fn ping(&self, instance: &InstanceId) -> PlatformResult<()> {
        NatsPlatform { client: self.client.clone(), instance: instance.clone() }.ping().await
    }
}

/// What a request over NATS needs, bundled up; implements Platform with it.
struct NatsPlatform {
    client: async_nats::Client,
    instance: InstanceId,
}

impl NatsPlatform {
    async fn request<Req, Resp>(&self, method: &str, req: &Req) -> PlatformResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(req)
            .map_err(|e| PlatformError::Remote(format!("encoding request: {}", e)))?;
        let request = self.client.request(subject(&self.instance, method), payload.into());
        let message = match tokio::time::timeout(DEFAULT_TIMEOUT, request).await {
            Err(_) => {
                return Err(PlatformError::Unavailable("request timed out".to_string()));
            }
            Ok(Err(err)) => {
                // No responders is NATS telling us nobody is subscribed; it
                // and a timeout both mean "no live daemon answered in time".
                return Err(match err.kind() {
                    RequestErrorKind::TimedOut => {
                        PlatformError::Unavailable("request timed out".to_string())
                    }
                    RequestErrorKind::NoResponders => {
                        PlatformError::Unavailable("no responders".to_string())
                    }
                    RequestErrorKind::Other => PlatformError::Remote(err.to_string()),
                });
            }
            Ok(Ok(message)) => message,
        };
        serde_json::from_slice(&message.payload)
            .map_err(|e| PlatformError::Remote(format!("decoding response: {}", e)))
    }
}

#[async_trait]
impl Platform for NatsPlatform {
    async fn ping(&self) -> PlatformResult<()> {
        let resp: PingResponse = self.request(METHOD_PING, &Ping {}).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn version(&self) -> PlatformResult<String> {
        let resp: VersionResponse = self.request(METHOD_VERSION, &Version {}).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(resp.version),
        }
    }

    async fn export(&self) -> PlatformResult<Vec<u8>> {
        let resp: ExportResponse = self.request(METHOD_EXPORT, &Export {}).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(resp.config),
        }
    }

    async fn list_services(
        &self,
        namespace: Option<String>,
    ) -> PlatformResult<Vec<drover_core::ServiceStatus>> {
        let resp: ListServicesResponse =
            self.request(METHOD_LIST_SERVICES, &ListServicesRequest { namespace }).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(resp.result),
        }
    }

    async fn list_images(
        &self,
        services: drover_core::ServiceSpec,
    ) -> PlatformResult<Vec<drover_core::ImageStatus>> {
        let resp: ListImagesResponse =
            self.request(METHOD_LIST_IMAGES, &ListImagesRequest { services }).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(resp.result),
        }
    }

    async fn update_images(
        &self,
        spec: drover_core::ReleaseSpec,
    ) -> PlatformResult<drover_core::ReleaseResult> {
        let resp: UpdateImagesResponse =
            self.request(METHOD_UPDATE_IMAGES, &UpdateImagesRequest { spec }).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(resp.result),
        }
    }

    async fn sync_cluster(&self) -> PlatformResult<()> {
        let resp: SyncClusterResponse = self.request(METHOD_SYNC_CLUSTER, &SyncCluster {}).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn sync_status(&self, reference: String) -> PlatformResult<Vec<String>> {
        let resp: SyncStatusResponse =
            self.request(METHOD_SYNC_STATUS, &SyncStatusRequest { reference }).await?;
        match extract_error(&resp.err) {
            Some(err) => Err(err),
            None => Ok(resp.result),
        }
    }
}
