//! Byte channel endpoints: TCP sockets and (with the `serial` feature) serial ports.
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::{debug, info};
use tokio::net::TcpStream;

use crate::link::{Link, LinkIdentity, RetryTuning};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp:HOST:PORT`
    Tcp(String),
    /// `serial:PATH:BAUD`
    Serial { path: String, baud: u32 },
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("Endpoint '{}' has no scheme (expected tcp: or serial:)", s))?;
        match scheme {
            "tcp" => {
                if rest.rsplit_once(':').is_none() {
                    return Err(anyhow!("TCP endpoint '{}' needs HOST:PORT", s));
                }
                Ok(Endpoint::Tcp(rest.to_string()))
            }
            "serial" => {
                let (path, baud) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("Serial endpoint '{}' needs PATH:BAUD", s))?;
                let baud = baud
                    .parse()
                    .map_err(|e| anyhow!("Invalid baud rate '{}': {}", baud, e))?;
                Ok(Endpoint::Serial {
                    path: path.to_string(),
                    baud,
                })
            }
            other => Err(anyhow!("Unknown endpoint scheme '{}'", other)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Serial { path, baud } => write!(f, "serial:{}:{}", path, baud),
        }
    }
}

/// Connect to `endpoint` and open a [`Link`] over it.
pub async fn open_link(
    endpoint: &Endpoint,
    identity: LinkIdentity,
    tuning: RetryTuning,
) -> Result<Link> {
    info!("Connecting to {}", endpoint);
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| anyhow!("Failed to connect to {}: {}", addr, e))?;
            stream.set_nodelay(true)?;
            debug!("TCP connected to {}", addr);
            Ok(Link::open(stream, identity, tuning))
        }
        #[cfg(feature = "serial")]
        Endpoint::Serial { path, baud } => {
            let stream = serial::open(path, *baud).await?;
            Ok(Link::open(stream, identity, tuning))
        }
        #[cfg(not(feature = "serial"))]
        Endpoint::Serial { path, .. } => Err(anyhow!(
            "Serial endpoint {} requested but built without the 'serial' feature",
            path
        )),
    }
}

#[cfg(feature = "serial")]
mod serial {
    use std::io::{ErrorKind, Read, Write};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use log::{debug, warn};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::runtime::Handle;
    use tokio::time::sleep;

    /// Open a blocking serial port and bridge it onto an in-memory duplex stream.
    pub(super) async fn open(port_name: &str, baud_rate: u32) -> Result<DuplexStream> {
        debug!("Opening serial port {} at {} baud", port_name, baud_rate);
        let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(100));
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder
            .open()
            .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;

        // Some USB adapters only pass data once DTR/RTS are raised
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;

        let mut reader = port
            .try_clone()
            .map_err(|e| anyhow!("Failed to clone serial port {}: {}", port_name, e))?;
        let mut writer = port;

        let (local, remote) = tokio::io::duplex(4096);
        let (mut from_link, mut to_link) = tokio::io::split(remote);
        let handle = Handle::current();
        let name = port_name.to_string();

        let inbound = handle.clone();
        let inbound_name = name.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if inbound.block_on(to_link.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("Serial read error on {}: {}", inbound_name, e);
                        break;
                    }
                }
            }
            debug!("Serial reader for {} exited", inbound_name);
        });

        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match handle.block_on(from_link.read(&mut buf)) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]).and_then(|_| writer.flush()) {
                            warn!("Serial write error on {}: {}", name, e);
                            break;
                        }
                    }
                }
            }
            debug!("Serial writer for {} exited", name);
        });

        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_serial_endpoints() {
        assert_eq!(
            "tcp:127.0.0.1:5760".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:5760".to_string())
        );
        assert_eq!(
            "serial:/dev/ttyACM0:57600".parse::<Endpoint>().unwrap(),
            Endpoint::Serial {
                path: "/dev/ttyACM0".to_string(),
                baud: 57600
            }
        );
        assert_eq!(
            "serial:COM3:115200".parse::<Endpoint>().unwrap().to_string(),
            "serial:COM3:115200"
        );
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!("127.0.0.1:5760".parse::<Endpoint>().is_err());
        assert!("tcp:localhost".parse::<Endpoint>().is_err());
        assert!("serial:/dev/ttyUSB0:fast".parse::<Endpoint>().is_err());
        assert!("udp:0.0.0.0:14550".parse::<Endpoint>().is_err());
    }
}
