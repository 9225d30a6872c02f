use std::cell::{Cell, RefCell};
use std::rc::Rc;

use wasm_bindgen::prelude::*;

use crate::services::FrameScheduler;

/// `requestAnimationFrame`-backed [`FrameScheduler`].
///
/// Requests made before the next frame fires coalesce into one callback.
pub struct AnimationFrames {
    inner: Rc<Inner>,
}

struct Inner {
    window: Option<web_sys::Window>,
    scheduled: Cell<bool>,
    raf_id: Cell<Option<i32>>,
    on_frame: RefCell<Option<Rc<dyn Fn()>>>,
    callback: RefCell<Option<Closure<dyn FnMut()>>>,
}

impl AnimationFrames {
    pub fn new() -> Self {
        let inner = Rc::new(Inner {
            window: web_sys::window(),
            scheduled: Cell::new(false),
            raf_id: Cell::new(None),
            on_frame: RefCell::new(None),
            callback: RefCell::new(None),
        });

        let inner_cb = inner.clone();
        let cb = Closure::<dyn FnMut()>::new(move || {
            inner_cb.scheduled.set(false);
            inner_cb.raf_id.set(None);
            let handler = inner_cb.on_frame.borrow().clone();
            if let Some(handler) = handler {
                handler();
            }
        });
        *inner.callback.borrow_mut() = Some(cb);

        Self { inner }
    }

    /// Install the function run on each frame. Set after construction because the
    /// handler usually needs the session that owns this scheduler.
    pub fn set_handler(&self, handler: impl Fn() + 'static) {
        *self.inner.on_frame.borrow_mut() = Some(Rc::new(handler));
    }
}

impl Default for AnimationFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler for AnimationFrames {
    fn request_frame(&self) {
        if self.inner.scheduled.replace(true) {
            return;
        }
        let cb_ref = self.inner.callback.borrow();
        let (Some(cb), Some(window)) = (cb_ref.as_ref(), self.inner.window.as_ref()) else {
            self.inner.scheduled.set(false);
            return;
        };
        match window.request_animation_frame(cb.as_ref().unchecked_ref()) {
            Ok(id) => self.inner.raf_id.set(Some(id)),
            Err(_) => self.inner.scheduled.set(false),
        }
    }
}

impl Drop for AnimationFrames {
    fn drop(&mut self) {
        if let Some(raf_id) = self.inner.raf_id.replace(None)
            && let Some(window) = self.inner.window.as_ref()
        {
            let _ = window.cancel_animation_frame(raf_id);
        }
        self.inner.scheduled.set(false);
        self.inner.on_frame.borrow_mut().take();
        // Break the callback->inner reference cycle on teardown.
        self.inner.callback.borrow_mut().take();
    }
}
