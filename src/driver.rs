//! UART scripting driver
//!
//! Composes a [`Session`] into the flow the command line runs: connect,
//! stream device output as lines, interrupt whatever the device is running,
//! upload a script and keep the link alive.

use crate::domain::settings::LivenessPolicy;
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol::INTERRUPT_SEQUENCE;
use crate::infrastructure::bluetooth::scanner::ScanFilter;
use crate::infrastructure::bluetooth::transport::Transport;
use crate::infrastructure::bluetooth::Session;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reassembles notification payloads into text lines.
///
/// The device terminates lines with `\r\n` but a notification can end
/// anywhere, so partial lines are held until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a payload and return every line it completed. Empty lines are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Take whatever is left without a terminator
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// How the driver finds its device and keeps it alive
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub filter: ScanFilter,
    /// 0 scans until a device shows up
    pub scan_timeout: Duration,
    pub liveness_interval: Duration,
    pub liveness_policy: LivenessPolicy,
}

pub struct Driver<T: Transport> {
    session: Session<T>,
    options: DriverOptions,
    output: mpsc::UnboundedSender<String>,
    assembler: Arc<Mutex<LineAssembler>>,
}

impl<T: Transport> Driver<T> {
    /// Device output lines are sent to `output`
    pub fn new(
        session: Session<T>,
        options: DriverOptions,
        output: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            session,
            options,
            output,
            assembler: Arc::new(Mutex::new(LineAssembler::new())),
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Connect, start streaming output, and interrupt the running program
    pub async fn start(&self) -> Result<()> {
        self.connect().await?;
        self.session.send_raw(INTERRUPT_SEQUENCE).await?;
        debug!("Interrupt sent");
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        info!("Scanning...");
        self.session
            .connect(self.options.filter.clone(), self.options.scan_timeout)
            .await?;
        self.attach_output().await
    }

    async fn attach_output(&self) -> Result<()> {
        let assembler = self.assembler.clone();
        let output = self.output.clone();
        self.session
            .enable_tx_notifications(move |bytes: &[u8]| {
                let lines = assembler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(bytes);
                for line in lines {
                    // the receiver going away just means nobody is printing
                    let _ = output.send(line);
                }
            })
            .await
    }

    /// Send a script to the device prompt
    pub async fn upload(&self, script: &str) -> Result<()> {
        info!("Uploading {} byte script", script.len());
        self.session.send_command(script).await
    }

    pub async fn send(&self, command: &str) -> Result<()> {
        self.session.send_command(command).await
    }

    /// Send a bare carriage return every interval until a poll fails.
    ///
    /// With [`LivenessPolicy::Exit`] the first failure is returned. With
    /// [`LivenessPolicy::Reconnect`] the driver scans for the device again,
    /// reattaches output and keeps polling; only a failed reconnect ends the
    /// loop.
    pub async fn poll_liveness(&self) -> Result<()> {
        loop {
            tokio::time::sleep(self.options.liveness_interval).await;

            let err = match self.session.send_command("\r").await {
                Ok(()) => {
                    debug!("Liveness poll sent");
                    continue;
                }
                Err(e) => e,
            };

            match self.options.liveness_policy {
                LivenessPolicy::Exit => return Err(err),
                LivenessPolicy::Reconnect => {
                    warn!("Liveness poll failed: {}; reconnecting", err);
                    self.session.disconnect().await;
                    self.connect().await?;
                    info!("Reconnected");
                }
            }
        }
    }

    /// Drop the link and emit any unterminated output
    pub async fn shutdown(&self) {
        self.session.disconnect().await;
        let rest = self
            .assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
        if let Some(line) = rest {
            let _ = self.output.send(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonocleError;
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::fake::FakeTransport;
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

    const ADDRESS: &str = "C0:FF:EE:C0:FF:EE";

    fn options(policy: LivenessPolicy) -> DriverOptions {
        DriverOptions {
            filter: ScanFilter::any_service(SERVICE_UUID),
            scan_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(10),
            liveness_policy: policy,
        }
    }

    /// Advertise the device every 100ms for the rest of the test
    fn keep_advertising(fake: &FakeTransport) {
        let advertiser = fake.clone();
        tokio::spawn(async move {
            loop {
                advertiser.advertise(FakeTransport::monocle_advert(ADDRESS));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    }

    async fn started_driver(
        fake: &FakeTransport,
        policy: LivenessPolicy,
    ) -> (Driver<FakeTransport>, mpsc::UnboundedReceiver<String>) {
        let session = Session::new(Arc::new(fake.clone()), ConnectionConfig::default())
            .await
            .unwrap();
        let (sender, receiver) = mpsc::unbounded_channel();
        let driver = Driver::new(session, options(policy), sender);
        keep_advertising(fake);
        driver.start().await.unwrap();
        (driver, receiver)
    }

    async fn wait_for_disconnect(driver: &Driver<FakeTransport>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while driver.session().is_connected().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never saw the disconnect");
    }

    #[test]
    fn test_line_assembler_splits_on_terminators() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push(b"10/16 09:").is_empty());
        assert_eq!(assembler.push(b"41:07\r\n87\r\n"), vec!["10/16 09:41:07", "87"]);
        assert_eq!(assembler.push(b"a\nb\rc"), vec!["a", "b"]);
        assert_eq!(assembler.flush().as_deref(), Some("c"));
        assert_eq!(assembler.flush(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_interrupts_and_streams_output() {
        let fake = FakeTransport::new();
        let (driver, mut lines) = started_driver(&fake, LivenessPolicy::Exit).await;

        assert!(driver.session().is_connected().await);
        assert_eq!(fake.writes(), vec![vec![0x03, 0x0d]]);

        assert!(fake.notify(b">>> 4/1 12:00"));
        assert!(fake.notify(b":00\r\n"));
        assert_eq!(lines.recv().await.as_deref(), Some(">>> 4/1 12:00:00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_rewrites_newlines() {
        let fake = FakeTransport::new();
        let (driver, _lines) = started_driver(&fake, LivenessPolicy::Exit).await;
        fake.clear_writes();

        driver.upload("import time\nprint(1)\n").await.unwrap();
        let sent: Vec<u8> = fake.writes().concat();
        assert_eq!(sent, b"import time\rprint(1)\r");
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_exit_policy_returns_error() {
        let fake = FakeTransport::new();
        let (driver, _lines) = started_driver(&fake, LivenessPolicy::Exit).await;
        fake.clear_writes();

        fake.emit_connection(ADDRESS, false);
        wait_for_disconnect(&driver).await;

        let err = driver.poll_liveness().await.unwrap_err();
        assert!(matches!(err, MonocleError::NotConnected));
        assert!(fake.writes().is_empty());
        assert_eq!(fake.scans_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_polls_every_interval() {
        let fake = FakeTransport::new();
        let (driver, _lines) = started_driver(&fake, LivenessPolicy::Exit).await;
        fake.clear_writes();

        let still_polling =
            tokio::time::timeout(Duration::from_secs(35), driver.poll_liveness()).await;
        assert!(still_polling.is_err());
        assert_eq!(fake.writes(), vec![b"\r".to_vec(); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_reconnect_policy() {
        let fake = FakeTransport::new();
        let (driver, mut lines) = started_driver(&fake, LivenessPolicy::Reconnect).await;
        fake.clear_writes();

        fake.emit_connection(ADDRESS, false);
        wait_for_disconnect(&driver).await;

        let still_polling =
            tokio::time::timeout(Duration::from_secs(25), driver.poll_liveness()).await;
        assert!(still_polling.is_err());

        assert!(driver.session().is_connected().await);
        assert_eq!(fake.scans_started(), 2);
        assert_eq!(fake.connect_calls().len(), 2);
        // no interrupt after a reconnect; the device program keeps running
        assert_eq!(fake.writes(), vec![b"\r".to_vec()]);

        assert!(fake.notify(b"92\r\n"));
        assert_eq!(lines.recv().await.as_deref(), Some("92"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_partial_line() {
        let fake = FakeTransport::new();
        let (driver, mut lines) = started_driver(&fake, LivenessPolicy::Exit).await;

        fake.notify(b"no newline");
        driver.shutdown().await;

        assert_eq!(lines.recv().await.as_deref(), Some("no newline"));
        assert!(!driver.session().is_connected().await);
        assert_eq!(fake.disconnect_calls(), 1);
    }
}
