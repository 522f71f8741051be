//! Client connection takeover through hyper's upgrade mechanism

use async_trait::async_trait;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use routeway_proxy::{HijackedStream, Hijacker};
use std::io;

/// Resolves once the `101 Switching Protocols` response has been written
pub struct UpgradeHijacker {
    on_upgrade: OnUpgrade,
}

impl UpgradeHijacker {
    pub fn new(on_upgrade: OnUpgrade) -> Self {
        Self { on_upgrade }
    }
}

#[async_trait]
impl Hijacker for UpgradeHijacker {
    async fn hijack(self: Box<Self>) -> io::Result<HijackedStream> {
        let upgraded = self.on_upgrade.await.map_err(io::Error::other)?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}
