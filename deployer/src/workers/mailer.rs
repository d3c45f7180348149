//! Drains the process-wide mail queue into the configured transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use crate::error::Error;
use crate::notification::mail::{Mail, Mailer};

use super::{Shutdown, Worker};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MailWorker {
    rx: Arc<Mutex<mpsc::Receiver<Mail>>>,
    mailer: Arc<dyn Mailer>,
    sender: String,
}

impl MailWorker {
    pub fn new(rx: mpsc::Receiver<Mail>, mailer: Arc<dyn Mailer>, sender: String) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
            mailer,
            sender,
        }
    }
}

#[async_trait]
impl Worker for MailWorker {
    fn name(&self) -> String {
        "mail-worker".to_owned()
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        while !shutdown.is_stopped() {
            let mail = {
                let mut rx = self.rx.lock().await;
                match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
                    Ok(Some(mail)) => mail,
                    Ok(None) => break,
                    Err(_elapsed) => continue,
                }
            };
            if let Err(e) = self.mailer.send(&self.sender, &mail).await {
                error!(subject = %mail.subject, error = %e, "could not send mail");
            }
        }
        Ok(())
    }
}
