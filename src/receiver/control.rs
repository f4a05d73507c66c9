//! Line-based control channel for a running receiver.
//!
//! Commands are single text lines, `NAME [ARG...]`, answered with a single
//! text line. The listener binds to localhost only; this is an operator
//! channel, not a public API.

use crate::error::DaqResult;
use crate::receiver::ReceiverCounters;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Pure command dispatch; all mutation goes through the shared counters.
pub fn dispatch_command(counters: &ReceiverCounters, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let name = match parts.next() {
        Some(n) => n,
        None => return String::new(),
    };
    match name {
        "reset_ro_count" => {
            counters.readout_count.store(1, Ordering::Relaxed);
            info!("Readout count reset by control command");
            "Readout count reset".to_string()
        }
        "set_publish_readouts" => match parts.next() {
            Some("true") | Some("True") => {
                counters.publish_readouts.store(true, Ordering::Relaxed);
                info!("Readout publishing unpaused");
                "Unpaused readout publishing".to_string()
            }
            Some("false") | Some("False") => {
                counters.publish_readouts.store(false, Ordering::Relaxed);
                info!("Readout publishing paused");
                "Paused readout publishing".to_string()
            }
            other => format!(
                "Unrecognized arg `{}` for command `set_publish_readouts`, no action taken",
                other.unwrap_or("")
            ),
        },
        "get_npackets_sent" => counters.total_packets.load(Ordering::Relaxed).to_string(),
        "ping" => "pong".to_string(),
        _ => format!("Error, No command '{}' found.", name),
    }
}

/// Accept loop for the control port. Each connection runs in its own task so
/// an idle operator session never blocks accept or shutdown.
pub struct ControlServer {
    listener: TcpListener,
    counters: Arc<ReceiverCounters>,
}

impl ControlServer {
    pub async fn bind(port: u16, counters: Arc<ReceiverCounters>) -> DaqResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!("Control channel listening on {}", listener.local_addr()?);
        Ok(Self { listener, counters })
    }

    pub fn local_addr(&self) -> DaqResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Control connection from {}", peer);
                        let counters = self.counters.clone();
                        let conn_stop = stop.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &counters, conn_stop).await {
                                warn!("Control connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Control accept failed: {}", e);
                    }
                },
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        debug!("Control channel stopping");
                        return;
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    counters: &ReceiverCounters,
    mut stop: watch::Receiver<bool>,
) -> DaqResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        let reply = dispatch_command(counters, &line);
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn ping_answers_pong() {
        let counters = ReceiverCounters::new();
        assert_eq!(dispatch_command(&counters, "ping"), "pong");
    }

    #[test]
    fn unknown_command_is_reported() {
        let counters = ReceiverCounters::new();
        assert_eq!(
            dispatch_command(&counters, "warp_drive on"),
            "Error, No command 'warp_drive' found."
        );
    }

    #[test]
    fn reset_ro_count_rewinds_the_sequence() {
        let counters = ReceiverCounters::new();
        counters.readout_count.store(500, Ordering::Relaxed);
        assert_eq!(
            dispatch_command(&counters, "reset_ro_count"),
            "Readout count reset"
        );
        assert_eq!(counters.readout_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn publish_toggle_and_bad_argument() {
        let counters = ReceiverCounters::new();
        assert_eq!(
            dispatch_command(&counters, "set_publish_readouts false"),
            "Paused readout publishing"
        );
        assert!(!counters.publish_readouts.load(Ordering::Relaxed));
        assert_eq!(
            dispatch_command(&counters, "set_publish_readouts true"),
            "Unpaused readout publishing"
        );
        assert!(counters.publish_readouts.load(Ordering::Relaxed));
        assert_eq!(
            dispatch_command(&counters, "set_publish_readouts maybe"),
            "Unrecognized arg `maybe` for command `set_publish_readouts`, no action taken"
        );
    }

    #[test]
    fn sent_count_reflects_ingested_packets() {
        let counters = ReceiverCounters::new();
        counters.total_packets.store(42, Ordering::Relaxed);
        assert_eq!(dispatch_command(&counters, "get_npackets_sent"), "42");
    }

    #[tokio::test]
    async fn control_round_trip_over_tcp() {
        let counters = Arc::new(ReceiverCounters::new());
        let server = ControlServer::bind(0, counters.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(stop_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong\n");
        drop(client);

        stop_tx.send(true).unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn stop_completes_while_a_client_is_connected() {
        let counters = Arc::new(ReceiverCounters::new());
        let server = ControlServer::bind(0, counters.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(stop_rx));

        // Keep the connection open across the stop signal.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong\n");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("accept loop must exit with a client still connected")
            .unwrap();
        drop(client);
    }
}
