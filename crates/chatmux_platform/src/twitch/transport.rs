#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

/// Byte stream an IRC session runs over.
pub trait IrcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IrcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIrcStream = Box<dyn IrcStream>;

/// Opens the stream for an endpoint. Tests swap in in-memory pipes.
pub type IrcConnector = Arc<dyn Fn(IrcEndpoint) -> BoxFuture<'static, anyhow::Result<BoxedIrcStream>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcEndpoint {
	pub host: String,
	pub port: u16,
	pub tls: bool,
}

/// TCP connector, wrapped in rustls when the endpoint asks for TLS.
pub fn default_connector(connect_timeout: Duration) -> IrcConnector {
	Arc::new(move |endpoint: IrcEndpoint| {
		Box::pin(open_stream(endpoint, connect_timeout)) as BoxFuture<'static, anyhow::Result<BoxedIrcStream>>
	})
}

async fn open_stream(endpoint: IrcEndpoint, connect_timeout: Duration) -> anyhow::Result<BoxedIrcStream> {
	let addr = (endpoint.host.as_str(), endpoint.port);
	let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
		.await
		.with_context(|| format!("irc connect to {}:{} timed out", endpoint.host, endpoint.port))?
		.with_context(|| format!("irc connect to {}:{}", endpoint.host, endpoint.port))?;
	let _ = tcp.set_nodelay(true);

	if !endpoint.tls {
		return Ok(Box::new(tcp));
	}

	let mut roots = RootCertStore::empty();
	roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
	let config = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	let connector = TlsConnector::from(Arc::new(config));

	let server_name = ServerName::try_from(endpoint.host.clone()).context("invalid irc host name")?;
	let tls = tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
		.await
		.context("irc tls handshake timed out")?
		.context("irc tls handshake")?;

	Ok(Box::new(tls))
}
