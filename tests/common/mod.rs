// ABOUTME: Shared test fixtures for the integration tests
// ABOUTME: Scripted Carabiner daemon and a recording mock DJ-Link engine

#![allow(dead_code)]

use beatbridge::djlink::{Beat, DjLink, MasterListener, PlaybackPosition};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// DJ-Link engine double that records everything the bridge does to it.
pub struct MockDjLink {
    pub running: AtomicBool,
    pub sending_status: AtomicBool,
    pub tempo_master: AtomicBool,
    pub synced: AtomicBool,
    pub playing: AtomicBool,
    pub became_master: AtomicBool,
    pub master_tempo: Mutex<f64>,
    pub position: Mutex<Option<PlaybackPosition>>,
    pub tempo_sets: Mutex<Vec<f64>>,
    pub adjustments: Mutex<Vec<i64>>,
    listeners: Mutex<Vec<Arc<dyn MasterListener>>>,
}

impl MockDjLink {
    /// A running engine with status packets enabled and nothing recorded.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            sending_status: AtomicBool::new(true),
            tempo_master: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            became_master: AtomicBool::new(false),
            master_tempo: Mutex::new(0.0),
            position: Mutex::new(None),
            tempo_sets: Mutex::new(Vec::new()),
            adjustments: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn set_position(&self, position: PlaybackPosition) {
        *self.position.lock() = Some(position);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Deliver a master tempo change to every registered listener.
    pub fn fire_tempo_changed(&self, tempo: f64) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.tempo_changed(tempo);
        }
    }

    /// Deliver a master beat packet to every registered listener.
    pub fn fire_new_beat(&self, beat: Beat) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.new_beat(beat);
        }
    }
}

impl DjLink for MockDjLink {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_sending_status(&self) -> bool {
        self.sending_status.load(Ordering::SeqCst)
    }

    fn is_tempo_master(&self) -> bool {
        self.tempo_master.load(Ordering::SeqCst)
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    fn set_tempo(&self, bpm: f64) {
        self.tempo_sets.lock().push(bpm);
    }

    fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    fn become_tempo_master(&self) {
        self.became_master.store(true, Ordering::SeqCst);
        self.tempo_master.store(true, Ordering::SeqCst);
    }

    fn master_tempo(&self) -> f64 {
        *self.master_tempo.lock()
    }

    fn playback_position(&self) -> Option<PlaybackPosition> {
        *self.position.lock()
    }

    fn adjust_playback_position(&self, ms_delta: i64) {
        self.adjustments.lock().push(ms_delta);
    }

    fn add_master_listener(&self, listener: Arc<dyn MasterListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    fn remove_master_listener(&self, listener: &Arc<dyn MasterListener>) {
        self.listeners
            .lock()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }
}

/// A playback position a quarter of the way into beat one of a bar.
pub fn quarter_beat_position() -> PlaybackPosition {
    PlaybackPosition {
        beat_phase: 0.25,
        bar_phase: 0.0625,
        beat_interval_ms: 500.0,
        bar_interval_ms: 2000.0,
    }
}

/// Scripted stand-in for the Carabiner daemon.
///
/// Accepts a single connection, optionally greets it (Carabiner pushes a
/// status as soon as a client connects), splits inbound traffic into lines,
/// and writes whatever the test pushes.
pub struct FakeDaemon {
    pub port: u16,
    from_bridge: mpsc::UnboundedReceiver<String>,
    to_bridge: mpsc::UnboundedSender<String>,
    close: Option<oneshot::Sender<()>>,
}

impl FakeDaemon {
    /// The next complete line the bridge sent, without its newline.
    pub async fn expect_line(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.from_bridge.recv())
            .await
            .expect("timed out waiting for a line from the bridge")
            .expect("daemon connection task ended")
    }

    /// True when the bridge stays quiet for the whole window.
    pub async fn no_line_within(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.from_bridge.recv())
            .await
            .is_err()
    }

    /// Queue raw text for the bridge.
    pub fn push(&self, text: &str) {
        self.to_bridge
            .send(text.to_string())
            .expect("daemon connection task ended");
    }

    /// Close the socket from the daemon side.
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

pub async fn spawn_daemon(greeting: Option<&str>) -> FakeDaemon {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind the fake daemon");
    let port = listener.local_addr().unwrap().port();
    let greeting = greeting.map(str::to_string);
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        if let Some(greeting) = greeting {
            if socket.write_all(greeting.as_bytes()).await.is_err() {
                return;
            }
        }
        let mut buffer = [0u8; 1024];
        let mut pending = String::new();
        loop {
            tokio::select! {
                read = socket.read(&mut buffer) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(count) => {
                        pending.push_str(std::str::from_utf8(&buffer[..count]).unwrap());
                        while let Some(end) = pending.find('\n') {
                            let line = pending[..end].to_string();
                            pending.drain(..=end);
                            let _ = line_tx.send(line);
                        }
                    }
                },
                pushed = push_rx.recv() => match pushed {
                    Some(text) => {
                        if socket.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut close_rx => break,
            }
        }
    });
    FakeDaemon {
        port,
        from_bridge: line_rx,
        to_bridge: push_tx,
        close: Some(close_tx),
    }
}

/// A localhost port with nothing listening on it.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
