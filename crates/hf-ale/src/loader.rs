//! Asset loading
//!
//! Sources are opened and released off the audio thread. The engine talks
//! to a [`SourceBroker`]: it files requests, polls deliveries once per
//! callback and hands back sources it no longer needs.
//!
//! - [`ImmediateBroker`] resolves on the calling thread (offline rendering, tests)
//! - [`ThreadedBroker`] runs a dedicated loader thread behind rtrb rings

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::layers::LayerId;
use crate::source::{AudioSource, BufferSource};
use crate::{AleError, AleResult};

/// Loader ring capacity
const LOADER_QUEUE_CAPACITY: usize = 64;

/// Idle sleep of the loader thread
const LOADER_IDLE: Duration = Duration::from_micros(500);

/// Which slot a source is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Layer(LayerId),
    /// Index into the engine's stinger banks
    Stinger(u8),
}

/// Broker answer to a request
pub enum Delivery {
    Ready(SlotKey, Box<dyn AudioSource>),
    Failed(SlotKey),
}

impl Delivery {
    pub fn key(&self) -> SlotKey {
        match self {
            Delivery::Ready(key, _) | Delivery::Failed(key) => *key,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Ready(key, _) => write!(f, "Ready({:?})", key),
            Delivery::Failed(key) => write!(f, "Failed({:?})", key),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASSET LIBRARY
// ═══════════════════════════════════════════════════════════════════════════════

/// Opens sources by asset name
pub trait AssetLibrary: Send + Sync {
    fn open(&self, asset: &str, looping: bool) -> AleResult<Box<dyn AudioSource>>;
}

/// Pre-rendered interleaved buffers keyed by asset name
#[derive(Debug, Default)]
pub struct MemoryLibrary {
    assets: RwLock<HashMap<String, (Arc<[f32]>, usize)>>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interleaved buffer
    pub fn insert(
        &self,
        asset: impl Into<String>,
        samples: impl Into<Arc<[f32]>>,
        channels: usize,
    ) {
        self.assets
            .write()
            .insert(asset.into(), (samples.into(), channels.max(1)));
    }

    /// Register a silent buffer
    pub fn insert_silence(&self, asset: impl Into<String>, frames: usize, channels: usize) {
        let channels = channels.max(1);
        self.insert(asset, vec![0.0f32; frames * channels], channels);
    }

    pub fn remove(&self, asset: &str) -> bool {
        self.assets.write().remove(asset).is_some()
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.assets.read().contains_key(asset)
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}

impl AssetLibrary for MemoryLibrary {
    fn open(&self, asset: &str, looping: bool) -> AleResult<Box<dyn AudioSource>> {
        let assets = self.assets.read();
        let (samples, channels) = assets.get(asset).ok_or_else(|| AleError::AssetLoad {
            asset: asset.to_string(),
            reason: "not in library".to_string(),
        })?;

        if samples.is_empty() {
            return Err(AleError::AssetLoad {
                asset: asset.to_string(),
                reason: "empty buffer".to_string(),
            });
        }

        Ok(Box::new(BufferSource::new(Arc::clone(samples), *channels, looping)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BROKER TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Source acquisition/release seam between the audio thread and the loader
pub trait SourceBroker: Send {
    /// File a request. Returns false if it could not be queued; the caller
    /// retries on its next activation attempt.
    fn request(&mut self, key: SlotKey, asset: &Arc<str>, looping: bool) -> bool;

    /// Next finished request, if any
    fn poll(&mut self) -> Option<Delivery>;

    /// Hand back a source that is no longer needed
    fn release(&mut self, source: Box<dyn AudioSource>);
}

// ═══════════════════════════════════════════════════════════════════════════════
// IMMEDIATE BROKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves requests synchronously
pub struct ImmediateBroker {
    library: Arc<dyn AssetLibrary>,
    ready: VecDeque<Delivery>,
    released: usize,
}

impl ImmediateBroker {
    pub fn new(library: Arc<dyn AssetLibrary>) -> Self {
        Self {
            library,
            ready: VecDeque::with_capacity(LOADER_QUEUE_CAPACITY),
            released: 0,
        }
    }

    /// Sources handed back so far
    pub fn released(&self) -> usize {
        self.released
    }
}

impl SourceBroker for ImmediateBroker {
    fn request(&mut self, key: SlotKey, asset: &Arc<str>, looping: bool) -> bool {
        let delivery = match self.library.open(asset, looping) {
            Ok(source) => Delivery::Ready(key, source),
            Err(e) => {
                log::error!("{}", e);
                Delivery::Failed(key)
            }
        };
        self.ready.push_back(delivery);
        true
    }

    fn poll(&mut self) -> Option<Delivery> {
        self.ready.pop_front()
    }

    fn release(&mut self, source: Box<dyn AudioSource>) {
        self.released += 1;
        drop(source);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// THREADED BROKER
// ═══════════════════════════════════════════════════════════════════════════════

struct LoadRequest {
    key: SlotKey,
    asset: Arc<str>,
    looping: bool,
}

/// Loader thread behind lock-free rings
pub struct ThreadedBroker {
    request_tx: Producer<LoadRequest>,
    delivery_rx: Consumer<Delivery>,
    release_tx: Producer<Box<dyn AudioSource>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedBroker {
    /// Spawn the loader thread
    pub fn spawn(library: Arc<dyn AssetLibrary>) -> AleResult<Self> {
        let (request_tx, request_rx) = RingBuffer::new(LOADER_QUEUE_CAPACITY);
        let (delivery_tx, delivery_rx) = RingBuffer::new(LOADER_QUEUE_CAPACITY);
        let (release_tx, release_rx) = RingBuffer::new(LOADER_QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let worker = thread::Builder::new()
            .name("hf-ale-loader".to_string())
            .spawn(move || {
                Self::worker_loop(library, request_rx, delivery_tx, release_rx, flag);
            })?;

        log::info!("Asset loader thread started");

        Ok(Self {
            request_tx,
            delivery_rx,
            release_tx,
            shutdown,
            worker: Some(worker),
        })
    }

    fn worker_loop(
        library: Arc<dyn AssetLibrary>,
        mut request_rx: Consumer<LoadRequest>,
        mut delivery_tx: Producer<Delivery>,
        mut release_rx: Consumer<Box<dyn AudioSource>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut backlog: VecDeque<Delivery> = VecDeque::new();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let mut busy = false;

            // Released sources are dropped here, never on the audio thread
            while let Ok(source) = release_rx.pop() {
                drop(source);
                busy = true;
            }

            while let Ok(request) = request_rx.pop() {
                busy = true;
                let delivery = match library.open(&request.asset, request.looping) {
                    Ok(source) => {
                        log::debug!("Loaded '{}' for {:?}", request.asset, request.key);
                        Delivery::Ready(request.key, source)
                    }
                    Err(e) => {
                        log::error!("{}", e);
                        Delivery::Failed(request.key)
                    }
                };
                backlog.push_back(delivery);
            }

            while let Some(delivery) = backlog.pop_front() {
                if let Err(rtrb::PushError::Full(delivery)) = delivery_tx.push(delivery) {
                    backlog.push_front(delivery);
                    break;
                }
            }

            if !busy {
                thread::sleep(LOADER_IDLE);
            }
        }
    }

    /// Stop and join the loader thread
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            log::info!("Asset loader thread stopped");
        }
    }
}

impl SourceBroker for ThreadedBroker {
    fn request(&mut self, key: SlotKey, asset: &Arc<str>, looping: bool) -> bool {
        let request = LoadRequest {
            key,
            asset: Arc::clone(asset),
            looping,
        };
        if self.request_tx.push(request).is_err() {
            log::warn!("Loader request queue full, {:?} retried later", key);
            return false;
        }
        true
    }

    fn poll(&mut self) -> Option<Delivery> {
        self.delivery_rx.pop().ok()
    }

    fn release(&mut self, source: Box<dyn AudioSource>) {
        if let Err(rtrb::PushError::Full(source)) = self.release_tx.push(source) {
            log::warn!("Loader release queue full, dropping source in place");
            drop(source);
        }
    }
}

impl Drop for ThreadedBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
