//! The block-event observer: walks the source chain height by height,
//! decodes the notifications addressed to our bridge instance, routes
//! signing requests to the signer and drives completion updates into the
//! ledger.

use crate::{
    chain::{ContractEvent, Notification, SourceChain},
    codec::SigningRequest,
    ledger::Ledger,
    rest::{self, SignTxRequest},
    retry::{self, Backoff},
    script,
};

use bitcoin::{consensus::encode, Transaction};

use std::{
    fs,
    path::PathBuf,
    sync::{mpsc::SyncSender, Arc},
    thread,
    time::Duration,
};

#[derive(Debug)]
pub struct SignClientError(pub String);

impl std::fmt::Display for SignClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Sign client error: {}", self.0)
    }
}

impl std::error::Error for SignClientError {}

/// Client for a signer running as its own process, exposing the signing
/// endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct SignClient {
    url: String,
    client: reqwest::blocking::Client,
}

impl SignClient {
    /// `addr` is the standalone signer's `host:port`.
    pub fn new(addr: &str) -> Result<Self, SignClientError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| SignClientError(e.to_string()))?;

        Ok(SignClient {
            url: format!("http://{}/api/v1/signtx", addr),
            client,
        })
    }

    pub fn send_to_sign(&self, request: &SigningRequest) -> Result<(), SignClientError> {
        let body = SignTxRequest {
            raw: hex::encode(request.encode()),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| SignClientError(e.to_string()))?;

        let response: rest::Response = response
            .json()
            .map_err(|e| SignClientError(format!("decoding response: {}", e)))?;
        if response.error != rest::ERR_OK || response.desc != rest::DESC_SUCCESS {
            return Err(SignClientError(format!(
                "signer refused the request: {}",
                response.desc
            )));
        }

        Ok(())
    }
}

/// Where decoded signing requests go: a bounded in-process queue when the
/// signer is co-located, a blocking network call when it runs standalone.
pub enum Handoff {
    Queue(SyncSender<SigningRequest>),
    Remote(SignClient),
}

pub struct Observer<C: SourceChain> {
    chain: C,
    handoff: Handoff,
    ledger: Arc<Ledger>,
    binding_key: String,
    data_dir: PathBuf,
    poll_interval: Duration,
    backoff: Backoff,
    checkpoint_interval: u32,
    start_height: u32,
}

impl<C: SourceChain> Observer<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: C,
        handoff: Handoff,
        ledger: Arc<Ledger>,
        binding_key: String,
        data_dir: PathBuf,
        poll_interval: Duration,
        backoff: Backoff,
        checkpoint_interval: u32,
        start_height: u32,
    ) -> Self {
        Observer {
            chain,
            handoff,
            ledger,
            binding_key,
            data_dir,
            poll_interval,
            backoff,
            checkpoint_interval,
            start_height,
        }
    }

    /// Scan the chain for the lifetime of the process. Only ever returns on
    /// process shutdown signals.
    pub fn run(&self) {
        let mut top = if self.start_height != 0 {
            self.start_height
        } else {
            self.last_height()
        };
        let mut last_recorded = top;
        log::info!(
            "observing with binding key {} from height {}, polling every {:?}",
            self.binding_key,
            top,
            self.poll_interval
        );

        loop {
            thread::sleep(self.poll_interval);
            self.tick(&mut top, &mut last_recorded);
        }
    }

    // One poll: catch up from `top` to the current chain height.
    fn tick(&self, top: &mut u32, last_recorded: &mut u32) {
        let new_top = match self.chain.block_height() {
            Ok(height) => height,
            Err(e) => {
                log::error!("querying current height, will retry: {}", e);
                thread::sleep(self.backoff.get());
                return;
            }
        };
        if new_top <= *top {
            return;
        }

        log::trace!("scanning heights {} to {}", *top + 1, new_top);
        let mut to_sign = 0;
        let mut height = *top + 1;
        while height <= new_top {
            // A height is never skipped: dropping one silently could lose a
            // signing request forever.
            let events = retry::forever(&self.backoff, "fetching block events", || {
                self.chain.events_at(height)
            });
            to_sign += self.scan_events(&events, height);
            height += 1;
        }
        if to_sign > 0 {
            log::info!("captured {} signing request(s) this tick", to_sign);
        }

        *top = new_top;
        // Batch cursor writes: anything replayed after a crash is bounded by
        // the checkpoint interval and handled idempotently downstream.
        if to_sign > 0 || *top - *last_recorded >= self.checkpoint_interval {
            if let Err(e) = self.store_cursor(*top) {
                log::error!("persisting resume cursor at {}: {}", top, e);
            }
            *last_recorded = *top;
        }
    }

    // Route the notifications addressed to us. Returns how many signing
    // requests were handed off.
    fn scan_events(&self, events: &[ContractEvent], height: u32) -> usize {
        let mut to_sign = 0;

        for event in events {
            for entry in &event.notifications {
                let notification = match Notification::from_states(&entry.states) {
                    Ok(Some(notification)) => notification,
                    Ok(None) => continue,
                    Err(e) => {
                        // No new data would make this decode; drop it.
                        log::error!("malformed notification at height {}: {}", height, e);
                        continue;
                    }
                };

                match notification {
                    Notification::SignRequest {
                        binding_key,
                        raw_tx,
                        amounts,
                    } => {
                        if binding_key != self.binding_key {
                            continue;
                        }
                        let tx = match decode_tx(&raw_tx) {
                            Ok(tx) => tx,
                            Err(e) => {
                                log::error!(
                                    "bad transaction in signing request at height {}: {}",
                                    height,
                                    e
                                );
                                continue;
                            }
                        };
                        let txid = script::canonical_txid(&tx);
                        self.hand_off(SigningRequest { tx, amounts });
                        to_sign += 1;
                        log::info!("captured signing request {} at height {}", txid, height);
                    }
                    Notification::SignComplete {
                        binding_key,
                        raw_tx,
                    } => {
                        if binding_key != self.binding_key {
                            continue;
                        }
                        let tx = match decode_tx(&raw_tx) {
                            Ok(tx) => tx,
                            Err(e) => {
                                log::error!(
                                    "bad transaction in completion at height {}: {}",
                                    height,
                                    e
                                );
                                continue;
                            }
                        };
                        let txid = script::canonical_txid(&tx);
                        if let Err(e) = self.ledger.mark_complete(&txid) {
                            log::error!("marking {} complete: {}", txid, e);
                            continue;
                        }
                        log::info!("signing {} completed on the source chain", txid);
                    }
                }
            }
        }

        to_sign
    }

    fn hand_off(&self, request: SigningRequest) {
        match &self.handoff {
            Handoff::Queue(sender) => {
                // Blocking push: a signer falling behind throttles block
                // scanning instead of growing memory without bound.
                if sender.send(request).is_err() {
                    log::error!("signing queue disconnected, dropping request");
                }
            }
            Handoff::Remote(client) => {
                retry::forever(&self.backoff, "posting signing request", || {
                    client.send_to_sign(&request)
                });
            }
        }
    }

    /// The height below which everything was already processed, as persisted
    /// by a previous run. Zero when there is none (or it is unreadable),
    /// meaning scan from wherever the chain currently is.
    pub fn last_height(&self) -> u32 {
        let raw = match fs::read_to_string(self.cursor_file()) {
            Ok(raw) => raw,
            Err(_) => return 0,
        };
        raw.trim().parse().unwrap_or(0)
    }

    fn store_cursor(&self, height: u32) -> Result<(), std::io::Error> {
        fs::write(self.cursor_file(), height.to_string())
    }

    fn cursor_file(&self) -> PathBuf {
        self.data_dir.join("last_height")
    }
}

fn decode_tx(raw: &str) -> Result<Transaction, String> {
    let bytes = hex::decode(raw).map_err(|e| format!("bad hex: {}", e))?;
    encode::deserialize(&bytes).map_err(|e| e.to_string())
}
