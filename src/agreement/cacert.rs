//! CA certificates for winsync peers
//!
//! A winsync agreement talks TLS to the Active Directory peer, so the peer's
//! CA certificate has to be known to the node first.

use std::path::Path;

use base64::Engine;

use crate::directory::{Directory, Dn, Entry, Layout};
use crate::error::{Error, Result};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// A PEM certificate that decoded cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCertificate {
    pub path: String,
    pub der: Vec<u8>,
}

impl CaCertificate {
    /// Parse the first certificate block of a PEM document
    pub fn from_pem(path: &str, pem: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Certificate {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let start = pem.find(PEM_BEGIN).ok_or_else(|| invalid("no PEM certificate block"))?;
        let body = &pem[start + PEM_BEGIN.len()..];
        let end = body.find(PEM_END).ok_or_else(|| invalid("unterminated PEM block"))?;
        let encoded: String = body[..end].chars().filter(|c| !c.is_whitespace()).collect();
        if encoded.is_empty() {
            return Err(invalid("empty PEM block"));
        }

        let der = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            path: path.to_string(),
            der,
        })
    }

    /// Read and parse a PEM file
    pub fn load(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let pem = std::fs::read_to_string(path).map_err(|e| Error::Certificate {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        Self::from_pem(&display, &pem)
    }

    /// Nickname under which the certificate is stored
    pub fn nickname(&self) -> String {
        Path::new(&self.path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "winsync CA".to_string())
    }
}

/// Store the certificate in the node's certificate container. An existing
/// entry with the same nickname is replaced.
pub async fn import(dir: &mut dyn Directory, layout: &Layout, cert: &CaCertificate) -> Result<Dn> {
    let nickname = cert.nickname();
    let dn = layout.certificates().child("cn", &nickname);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&cert.der);

    match dir.delete_entry(&dn).await {
        Ok(()) => tracing::debug!("Replacing certificate {} on {}", nickname, dir.host()),
        Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let entry = Entry::new(dn.clone())
        .with("objectClass", ["top", "nsContainer", "pkiCA"])
        .with("cn", [nickname.as_str()])
        .with("cACertificate;binary", [encoded]);
    dir.add_entry(entry).await?;
    tracing::info!("Added CA certificate {} to {}", cert.path, dir.host());
    Ok(dn)
}
