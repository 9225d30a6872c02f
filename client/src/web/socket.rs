use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::channel::oneshot;
use pixelgrid_shared::{InboundMessage, SectorCoord};
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;
use web_sys::{BinaryType, CloseEvent, Event, MessageEvent, WebSocket};

use crate::error::TransportError;
use crate::services::{RealtimeTransport, TransportEvent};

type EventHandler = Rc<dyn Fn(TransportEvent)>;

/// One open socket plus the JS callbacks that must outlive it.
struct Channel {
    ws: WebSocket,
    _on_open: Closure<dyn FnMut()>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
    _on_error: Closure<dyn FnMut(Event)>,
}

impl Channel {
    fn is_open(&self) -> bool {
        self.ws.ready_state() == WebSocket::OPEN
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.ws.set_onopen(None);
        self.ws.set_onmessage(None);
        self.ws.set_onclose(None);
        self.ws.set_onerror(None);
        let _ = self.ws.close();
    }
}

/// WebSocket transport with one socket per sector channel at `{base}/ws/sectors/{sx}/{sy}`.
///
/// `connect` opens the home channel (the focus sector) and only that channel reports
/// events to the installed handler. Sends to other sectors open their channel on demand.
pub struct WebSocketTransport {
    base_url: String,
    home: Cell<SectorCoord>,
    channels: RefCell<HashMap<SectorCoord, Channel>>,
    handler: RefCell<Option<EventHandler>>,
}

impl WebSocketTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            home: Cell::new(SectorCoord::new(0, 0)),
            channels: RefCell::new(HashMap::new()),
            handler: RefCell::new(None),
        }
    }

    pub fn set_event_handler(&self, handler: impl Fn(TransportEvent) + 'static) {
        *self.handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Sector whose channel `connect` opens and `is_open` reports on. Switching
    /// closes the previous home channel without reporting a close event.
    pub fn set_home_sector(&self, sector: SectorCoord) {
        let previous = self.home.replace(sector);
        if previous != sector {
            self.channels.borrow_mut().remove(&previous);
        }
    }

    fn url(&self, sector: SectorCoord) -> String {
        format!("{}/ws/sectors/{}/{}", self.base_url, sector.x, sector.y)
    }

    fn emit(handler: &RefCell<Option<EventHandler>>, event: TransportEvent) {
        let handler = handler.borrow().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Open a socket for `sector` and wait until it opens or fails.
    async fn open_channel(&self, sector: SectorCoord) -> Result<(), TransportError> {
        // Drop any stale socket before replacing it, outside of its own callbacks.
        self.channels.borrow_mut().remove(&sector);

        let ws = WebSocket::new(&self.url(sector))
            .map_err(|e| TransportError::Connect(format!("{e:?}")))?;
        ws.set_binary_type(BinaryType::Arraybuffer);

        let (tx, rx) = oneshot::channel::<Result<(), String>>();
        let ready = Rc::new(RefCell::new(Some(tx)));
        let handler = Rc::new(RefCell::new(self.handler.borrow().clone()));
        // Inbound traffic is addressed to the focus sector, so only the home channel
        // reports events. Other channels are send-only.
        let is_home = sector == self.home.get();

        let ready_open = ready.clone();
        let handler_open = handler.clone();
        let on_open = Closure::<dyn FnMut()>::new(move || {
            if let Some(tx) = ready_open.borrow_mut().take() {
                let _ = tx.send(Ok(()));
            }
            if is_home {
                Self::emit(&handler_open, TransportEvent::Open);
            }
        });
        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));

        let handler_message = handler.clone();
        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            if !is_home {
                return;
            }
            let data = event.data();
            let message = if let Ok(buf) = data.dyn_into::<js_sys::ArrayBuffer>() {
                InboundMessage::Binary(js_sys::Uint8Array::new(&buf).to_vec())
            } else if let Some(text) = event.data().as_string() {
                InboundMessage::Text(text)
            } else {
                warn!("ignoring websocket message with unsupported payload type");
                return;
            };
            Self::emit(&handler_message, TransportEvent::Message(message));
        });
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

        let ready_close = ready.clone();
        let handler_close = handler.clone();
        let on_close = Closure::<dyn FnMut(CloseEvent)>::new(move |event: CloseEvent| {
            if let Some(tx) = ready_close.borrow_mut().take() {
                let _ = tx.send(Err(format!("closed with code {}", event.code())));
            }
            if is_home {
                Self::emit(&handler_close, TransportEvent::Close);
            }
        });
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        let ready_error = ready;
        let handler_error = handler;
        let on_error = Closure::<dyn FnMut(Event)>::new(move |_event: Event| {
            if let Some(tx) = ready_error.borrow_mut().take() {
                let _ = tx.send(Err("socket error before open".to_string()));
            }
            if is_home {
                Self::emit(&handler_error, TransportEvent::Error("websocket error".into()));
            }
        });
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        self.channels.borrow_mut().insert(
            sector,
            Channel {
                ws,
                _on_open: on_open,
                _on_message: on_message,
                _on_close: on_close,
                _on_error: on_error,
            },
        );

        match rx.await {
            Ok(Ok(())) => {
                debug!(sector = %sector, "websocket channel open");
                Ok(())
            }
            Ok(Err(reason)) => Err(TransportError::Connect(reason)),
            Err(_) => Err(TransportError::Connect("channel dropped before open".into())),
        }
    }
}

impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.open_channel(self.home.get()).await
    }

    async fn send(&self, sector: SectorCoord, payload: Vec<u8>) -> Result<(), TransportError> {
        let open = self
            .channels
            .borrow()
            .get(&sector)
            .is_some_and(Channel::is_open);
        if !open {
            self.open_channel(sector).await?;
        }
        let channels = self.channels.borrow();
        let channel = channels.get(&sector).ok_or(TransportError::NotConnected)?;
        channel
            .ws
            .send_with_u8_array(&payload)
            .map_err(|e| TransportError::Send(format!("{e:?}")))
    }

    fn is_open(&self) -> bool {
        self.channels
            .borrow()
            .get(&self.home.get())
            .is_some_and(Channel::is_open)
    }
}
