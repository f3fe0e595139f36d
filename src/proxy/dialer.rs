//! Round-robin upstream selection

use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::time;

use crate::common::{ProxyError, Result};
use crate::net::{dial_datagram, dial_stream, BoxStream, DatagramConn};

/// Cycles through a fixed, non-empty list of upstream targets
///
/// Each target may carry a scheme (`tcp://`, `unix://`, `udp4://`, ...)
/// selecting the transport used to reach it.
#[derive(Debug)]
pub struct RoundRobinDialer {
    targets: Vec<String>,
    cursor: Mutex<usize>,
    connect_timeout: Option<Duration>,
}

impl RoundRobinDialer {
    /// Create a dialer over `targets`
    ///
    /// # Panics
    ///
    /// Panics if `targets` is empty; use [`try_new`](Self::try_new) to get an
    /// error instead.
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match Self::try_new(targets) {
            Ok(dialer) => dialer,
            Err(e) => panic!("{}", e),
        }
    }

    /// Create a dialer over `targets`, failing on an empty list
    pub fn try_new<I, S>(targets: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        if targets.is_empty() {
            return Err(ProxyError::Config(
                "round-robin dialer needs at least one target".to_string(),
            ));
        }
        Ok(Self {
            targets,
            cursor: Mutex::new(0),
            connect_timeout: None,
        })
    }

    /// Bound every dial by `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// The target for the next dial; advances the cursor
    pub fn next_target(&self) -> &str {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let target = &self.targets[*cursor];
        *cursor = (*cursor + 1) % self.targets.len();
        target
    }

    async fn timed<T, F>(&self, target: &str, dial: F) -> io::Result<T>
    where
        F: std::future::Future<Output = io::Result<T>>,
    {
        match self.connect_timeout {
            Some(timeout) => time::timeout(timeout, dial).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection to {} timed out", target),
                )
            })?,
            None => dial.await,
        }
    }

    /// Dial the next target as a stream
    pub async fn dial_stream(&self) -> io::Result<BoxStream> {
        let target = self.next_target();
        debug!("Dialing stream upstream {}", target);
        self.timed(target, dial_stream(target)).await
    }

    /// Dial the next target as a datagram socket
    pub async fn dial_datagram(&self) -> io::Result<DatagramConn> {
        let target = self.next_target();
        debug!("Dialing datagram upstream {}", target);
        self.timed(target, dial_datagram(target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_round_robin_order() {
        let dialer = RoundRobinDialer::new(["A", "B", "C"]);
        let picked: Vec<&str> = (0..6).map(|_| dialer.next_target()).collect();
        assert_eq!(picked, vec!["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn test_concurrent_picks_are_balanced() {
        let dialer = Arc::new(RoundRobinDialer::new(["A", "B", "C"]));
        let threads: Vec<_> = (0..3)
            .map(|_| {
                let dialer = dialer.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| dialer.next_target().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for t in threads {
            for target in t.join().unwrap() {
                *counts.entry(target).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![100, 100, 100]);
    }

    #[test]
    fn test_empty_targets() {
        assert!(matches!(
            RoundRobinDialer::try_new(Vec::<String>::new()),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    #[should_panic(expected = "at least one target")]
    fn test_new_panics_on_empty() {
        RoundRobinDialer::new(Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let dialer = RoundRobinDialer::new(["10.255.255.1:9"])
            .with_connect_timeout(Duration::from_millis(50));
        let started = time::Instant::now();

        let err = dialer
            .timed("10.255.255.1:9", futures::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_without_timeout_passes_result_through() {
        let dialer = RoundRobinDialer::new(["A"]);
        let err = dialer
            .timed("A", async {
                time::sleep(Duration::from_secs(3600)).await;
                Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
