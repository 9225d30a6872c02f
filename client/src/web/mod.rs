//! Browser bindings: `localStorage`, HTTP fetches, WebSockets and `requestAnimationFrame`.

mod frame;
mod network;
mod socket;
mod storage;

use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use pixelgrid_shared::SectorCoord;
use wasm_bindgen_futures::spawn_local;

pub use frame::AnimationFrames;
pub use network::HttpNetwork;
pub use socket::WebSocketTransport;
pub use storage::BrowserStorage;

use crate::clock::{SleepFn, SystemClock};
use crate::config::EngineConfig;
use crate::services::RealtimeTransport;
use crate::session::{Session, SessionServices};

pub type BrowserSession = Session<BrowserStorage, HttpNetwork, WebSocketTransport>;

#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Origin of the HTTP pixel API, e.g. `""` for same-origin.
    pub api_base: String,
    /// WebSocket origin, e.g. `wss://example.org`.
    pub socket_base: String,
    /// Prefix for every `localStorage` key.
    pub storage_prefix: String,
}

/// A running browser session with its transport and frame scheduler.
pub struct BrowserApp {
    session: Rc<BrowserSession>,
    transport: Rc<WebSocketTransport>,
    _frames: Rc<AnimationFrames>,
}

fn browser_sleep() -> Rc<SleepFn> {
    Rc::new(|delay: Duration| -> LocalBoxFuture<'static, ()> {
        Box::pin(gloo_timers::future::sleep(delay))
    })
}

impl BrowserApp {
    /// Build the session, hook transport events and frames to it, and spawn the
    /// initial load plus the autosave and offline-flush loops.
    pub fn mount(config: EngineConfig, endpoints: Endpoints) -> Self {
        let transport = Rc::new(WebSocketTransport::new(endpoints.socket_base));
        let frames = Rc::new(AnimationFrames::new());
        let session = Rc::new(Session::new(
            config,
            SessionServices {
                clock: Rc::new(SystemClock),
                storage: Rc::new(BrowserStorage::new(endpoints.storage_prefix)),
                network: Rc::new(HttpNetwork::new(endpoints.api_base)),
                transport: Rc::clone(&transport),
                frames: frames.clone(),
                sleep: browser_sleep(),
            },
        ));

        let weak: Weak<BrowserSession> = Rc::downgrade(&session);
        transport.set_event_handler(move |event| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            spawn_local(async move {
                session.handle_transport_event(event).await;
            });
        });

        let weak: Weak<BrowserSession> = Rc::downgrade(&session);
        frames.set_handler(move || {
            if let Some(session) = weak.upgrade() {
                session.on_frame();
            }
        });

        for task in [Task::Start, Task::Autosave, Task::OfflineFlush] {
            let session = Rc::clone(&session);
            spawn_local(async move {
                match task {
                    Task::Start => {
                        session.start().await;
                    }
                    Task::Autosave => session.run_autosave().await,
                    Task::OfflineFlush => session.run_offline_flush().await,
                }
            });
        }

        Self {
            session,
            transport,
            _frames: frames,
        }
    }

    pub fn session(&self) -> &Rc<BrowserSession> {
        &self.session
    }

    /// Move the realtime channel and ingest focus to `sector`.
    pub async fn set_focus_sector(&self, sector: SectorCoord) -> usize {
        self.transport.set_home_sector(sector);
        let loaded = self.session.set_focus_sector(sector).await;
        if !self.transport.is_open() {
            self.session.connect().await;
        }
        loaded
    }

    /// Stop the loops and save outstanding edits, e.g. from a `pagehide` handler.
    pub fn unmount(&self) {
        let session = Rc::clone(&self.session);
        spawn_local(async move {
            session.shutdown().await;
        });
    }
}

#[derive(Clone, Copy)]
enum Task {
    Start,
    Autosave,
    OfflineFlush,
}
