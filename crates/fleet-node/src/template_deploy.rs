//! Template deployment over chunked transfers.
//!
//! The sender streams a tar archive; the session header names the target
//! storage and template. The receiver pauses the tick loop while it writes.

use std::fs::File;
use std::sync::Arc;

use fleet_network::{Channel, ChunkError, ChunkSessionCallback, ChunkedPacketSender, TransferStatus};
use fleet_protocol::ChunkSessionInfo;
use fleet_storage::{ServiceTemplate, TemplateStorageProvider};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::tick::TickGate;

/// Transfer channel the deploy callback is registered under.
pub const DEPLOY_TEMPLATE_TRANSFER: &str = "deploy_service_template";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDeployHeader {
    pub storage: String,
    pub template: ServiceTemplate,
    /// Delete the existing template before unpacking.
    #[serde(default)]
    pub overwrite: bool,
}

impl TemplateDeployHeader {
    pub fn new(template: ServiceTemplate, overwrite: bool) -> Self {
        Self {
            storage: template.storage.clone(),
            template,
            overwrite,
        }
    }
}

pub struct TemplateDeployCallback {
    templates: Arc<TemplateStorageProvider>,
    gate: TickGate,
}

impl TemplateDeployCallback {
    pub fn new(templates: Arc<TemplateStorageProvider>, gate: TickGate) -> Self {
        Self { templates, gate }
    }
}

fn callback_err(e: impl std::fmt::Display) -> ChunkError {
    ChunkError::Callback(e.to_string())
}

impl ChunkSessionCallback for TemplateDeployCallback {
    fn complete(&self, info: &ChunkSessionInfo, data: &mut File) -> Result<(), ChunkError> {
        let header: TemplateDeployHeader =
            serde_json::from_slice(&info.header).map_err(callback_err)?;
        let storage = self.templates.storage(&header.storage).map_err(callback_err)?;

        let _pause = self.gate.pause();
        if header.overwrite && storage.delete(&header.template).map_err(callback_err)? {
            tracing::debug!(template = %header.template, "deleted template before overwrite");
        }
        storage.deploy(&header.template, data).map_err(callback_err)?;

        tracing::info!(
            template = %header.template,
            session = %info.session_id,
            overwrite = header.overwrite,
            "template deployed"
        );
        Ok(())
    }
}

/// Stream a tar archive from `source` to the node behind `channel`.
/// `size` is the archive length when known.
pub async fn deploy_template<R>(
    channel: Channel,
    header: &TemplateDeployHeader,
    source: R,
    size: Option<u64>,
) -> Result<TransferStatus, ChunkError>
where
    R: AsyncRead + Unpin,
{
    let header_bytes = serde_json::to_vec(header).map_err(fleet_protocol::ProtocolError::from)?;
    let mut sender = ChunkedPacketSender::new(channel, DEPLOY_TEMPLATE_TRANSFER, header_bytes);
    if let Some(size) = size {
        sender = sender.total_size(size);
    }
    sender.send(source).await
}
