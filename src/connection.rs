use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tracing::{error, info, warn};

use crate::{
    error::{Error, ErrorCode},
    transport::NatsTransport,
    JetStreamResult,
};

pub const DEFAULT_URL: &str = "nats://localhost:4222";
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

/// How to reach and authenticate against the NATS servers.
///
/// Durations are whole seconds and zero means the client default.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ConnectionOptions {
    pub urls: Vec<String>,
    pub max_reconnects: i64,
    pub reconnect_wait: i64,
    pub ping_interval: i64,
    pub max_pings_out: i64,
    pub allow_reconnect: bool,
    pub tls: Option<TlsOptions>,
    pub user: String,
    pub password: String,
    pub token: String,
    pub api_timeout: i64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            urls: Vec::new(),
            max_reconnects: 0,
            reconnect_wait: 0,
            ping_interval: 0,
            max_pings_out: 0,
            allow_reconnect: true,
            tls: None,
            user: String::new(),
            password: String::new(),
            token: String::new(),
            api_timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct TlsOptions {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    /// Skips verification of the server certificate.
    pub insecure: bool,
}

impl TlsOptions {
    fn client_certificate(&self) -> Option<(PathBuf, PathBuf)> {
        if self.cert_file.is_empty() || self.key_file.is_empty() {
            None
        } else {
            Some((PathBuf::from(&self.cert_file), PathBuf::from(&self.key_file)))
        }
    }
}

impl ConnectionOptions {
    /// Checks the options and fills in the default server URL.
    pub fn validate(&mut self) -> JetStreamResult<()> {
        if self.urls.is_empty() {
            self.urls.push(DEFAULT_URL.to_owned());
        }
        for server in &self.urls {
            url::Url::parse(server).map_err(|err| {
                Error::with_source(
                    ErrorCode::InvalidConfig,
                    format!("invalid server url {server}"),
                    err,
                )
            })?;
        }

        let numbers = [
            ("maxReconnects", self.max_reconnects),
            ("reconnectWait", self.reconnect_wait),
            ("pingInterval", self.ping_interval),
            ("maxPingsOut", self.max_pings_out),
            ("apiTimeout", self.api_timeout),
        ];
        for (field, value) in numbers {
            if value < 0 {
                return Err(Error::new(
                    ErrorCode::InvalidConfig,
                    format!("{field} must be non-negative"),
                ));
            }
        }

        if let Some(tls) = &self.tls {
            if !tls.cert_file.is_empty() && tls.key_file.is_empty() {
                return Err(Error::new(
                    ErrorCode::InvalidConfig,
                    "certFile specified but keyFile is missing",
                ));
            }
            if !tls.key_file.is_empty() && tls.cert_file.is_empty() {
                return Err(Error::new(
                    ErrorCode::InvalidConfig,
                    "keyFile specified but certFile is missing",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn api_timeout(&self) -> Duration {
        if self.api_timeout > 0 {
            Duration::from_secs(self.api_timeout as u64)
        } else {
            DEFAULT_API_TIMEOUT
        }
    }

    fn connect_options(&self) -> JetStreamResult<async_nats::ConnectOptions> {
        let mut options = async_nats::ConnectOptions::new();

        if !self.user.is_empty() && !self.password.is_empty() {
            options = options.user_and_password(self.user.clone(), self.password.clone());
        } else if !self.token.is_empty() {
            options = options.token(self.token.clone());
        }

        if !self.allow_reconnect {
            // a single attempt before the client gives up
            options = options.max_reconnects(Some(0));
        } else if self.max_reconnects > 0 {
            options = options.max_reconnects(Some(self.max_reconnects as usize));
        }
        if self.reconnect_wait > 0 {
            let wait = Duration::from_secs(self.reconnect_wait as u64);
            options = options.reconnect_delay_callback(move |_| wait);
        }
        if self.ping_interval > 0 {
            options = options.ping_interval(Duration::from_secs(self.ping_interval as u64));
        }

        if let Some(tls) = &self.tls {
            options = options.require_tls(true);
            if !tls.ca_file.is_empty() {
                options = options.add_root_certificates(PathBuf::from(&tls.ca_file));
            }
            if tls.insecure {
                options = options.tls_client_config(insecure_client_config(tls)?);
            } else if let Some((cert, key)) = tls.client_certificate() {
                options = options.add_client_certificate(cert, key);
            }
        }

        Ok(options.event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("nats connection established"),
                async_nats::Event::Disconnected => warn!("nats disconnected"),
                other => error!(event = %other, "nats connection event"),
            }
        }))
    }

    /// Opens the connection to the servers.
    pub async fn connect(mut self) -> JetStreamResult<NatsTransport> {
        self.validate()?;
        let options = self.connect_options()?;
        let servers = self.urls.join(",");

        let client = options.connect(servers.as_str()).await.map_err(|err| {
            Error::with_source(
                ErrorCode::ConnectFailed,
                format!("failed to connect to {servers}"),
                err,
            )
        })?;
        info!(%servers, "connected");

        Ok(NatsTransport::new(client, self.api_timeout()))
    }
}

fn insecure_client_config(tls: &TlsOptions) -> JetStreamResult<ClientConfig> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| {
            Error::with_source(ErrorCode::InvalidConfig, "unsupported tls protocol", err)
        })?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)));

    match tls.client_certificate() {
        Some((cert, key)) => {
            let certs = load_certs(&cert)?;
            let key = load_key(&key)?;
            builder.with_client_auth_cert(certs, key).map_err(|err| {
                Error::with_source(ErrorCode::InvalidConfig, "invalid client certificate", err)
            })
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

fn open(path: &Path) -> JetStreamResult<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|err| {
        Error::with_source(
            ErrorCode::InvalidConfig,
            format!("cannot read {}", path.display()),
            err,
        )
    })
}

fn load_certs(path: &Path) -> JetStreamResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::with_source(
                ErrorCode::InvalidConfig,
                format!("invalid certificate in {}", path.display()),
                err,
            )
        })
}

fn load_key(path: &Path) -> JetStreamResult<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|err| {
            Error::with_source(
                ErrorCode::InvalidConfig,
                format!("invalid private key in {}", path.display()),
                err,
            )
        })?
        .ok_or_else(|| {
            Error::new(
                ErrorCode::InvalidConfig,
                format!("no private key in {}", path.display()),
            )
        })
}

/// Accepts any server certificate, still checking handshake signatures.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
