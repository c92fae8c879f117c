//! TLS credentials: loading PEM files into a rustls server config, and
//! generating throwaway self-signed certificates for development.

use crate::error::{ServiceError, ServiceResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> ServiceResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| ServiceError::Tls(format!("cannot read cert {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServiceError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> ServiceResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| ServiceError::Tls(format!("cannot read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| ServiceError::Tls(format!("no private key found in {}", path.display())))
}

/// Build a rustls `ServerConfig` from a certificate chain and key.
///
/// When `client_ca` is set, clients must present a certificate that chains to
/// one of its roots.
pub fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> ServiceResult<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = match client_ca {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            let verifier =
                rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| ServiceError::Tls(format!("client verifier: {e}")))?;
            info!(ca = %ca_path.display(), "client certificates required");
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    Ok(builder.with_single_cert(certs, key)?)
}

/// Generate a self-signed certificate for `name`, written as
/// `<dir>/<name>.crt` and `<dir>/<name>.key`.
pub fn generate_self_signed_cert(dir: &Path, name: &str) -> ServiceResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let cert_path = dir.join(format!("{name}.crt"));
    let key_path = dir.join(format!("{name}.key"));

    let tls_err = |e: rcgen::Error| ServiceError::Tls(format!("certificate generation: {e}"));

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(tls_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, format!("{name} dev cert"));

    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}
