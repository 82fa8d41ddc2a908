// SOCKS5 client - talks to the local anonymizing proxy (RFC 1928, no auth)
//
// Hosts that are not IP literals are sent as domain names so the proxy
// resolves them; this is what makes .onion addresses reachable.

use super::{BoxedStream, PeerAddress, ProxyConnector, TransportError};
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Connector for a SOCKS5 proxy such as a local tor daemon
#[derive(Debug, Clone)]
pub struct Socks5Proxy {
    host: String,
    port: u16,
}

impl Socks5Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    async fn open(&self) -> Result<TcpStream, TransportError> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::ProxyUnavailable(format!("{}: {}", self.endpoint(), e)))
    }
}

#[async_trait]
impl ProxyConnector for Socks5Proxy {
    fn endpoint(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        let mut stream = self.open().await?;
        greet(&mut stream).await
    }

    async fn dial(&self, address: &PeerAddress) -> Result<BoxedStream, TransportError> {
        let mut stream = self.open().await?;
        let _ = stream.set_nodelay(true);
        connect(&mut stream, address).await?;
        Ok(Box::new(stream))
    }
}

/// Method negotiation; only "no authentication" is offered
pub async fn greet<S>(stream: &mut S) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| TransportError::ProxyUnavailable(format!("no greeting reply: {}", e)))?;

    if reply != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(TransportError::ProxyUnavailable(format!(
            "unexpected greeting reply {:02x?}",
            reply
        )));
    }
    Ok(())
}

/// Greet, then ask the proxy to CONNECT to `target`
pub async fn connect<S>(stream: &mut S, target: &PeerAddress) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    greet(stream).await?;
    stream.write_all(&connect_request(target)?).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(TransportError::ProxyUnavailable(format!("bad reply version {}", head[0])));
    }
    if head[1] != 0 {
        return Err(reply_error(head[1], target));
    }

    // Skip the bound address
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => stream.read_u8().await? as usize + 2,
        other => {
            return Err(TransportError::ProxyUnavailable(format!("bad address type {}", other)));
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn connect_request(target: &PeerAddress) -> Result<Vec<u8>, TransportError> {
    let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0];

    match target.host().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target.host().as_bytes();
            let len = u8::try_from(host.len())
                .map_err(|_| TransportError::InvalidAddress(format!("host too long: {}", target)))?;
            req.push(ATYP_DOMAIN);
            req.push(len);
            req.extend_from_slice(host);
        }
    }

    req.extend_from_slice(&target.port().to_be_bytes());
    Ok(req)
}

fn reply_error(code: u8, target: &PeerAddress) -> TransportError {
    match code {
        2 | 5 => TransportError::Refused(format!("{} (socks reply {})", target, code)),
        6 => TransportError::Timeout,
        7 | 8 => TransportError::ProxyUnavailable(format!("unsupported request (socks reply {})", code)),
        _ => TransportError::ConnectionFailed(format!("{} (socks reply {})", target, code)),
    }
}
