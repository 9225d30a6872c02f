use std::cell::{Cell, RefCell};
use std::rc::Rc;

use pixelgrid_shared::{Color, LocalCoord, PixelKey, SectorCoord};
use tracing::warn;

use crate::error::SubscriberError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Update,
    Remove,
}

/// Which path wrote the pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
    Load,
}

/// One effective pixel mutation, emitted after the store has applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelChange {
    pub key: PixelKey,
    pub old: Option<Color>,
    pub new: Option<Color>,
    pub action: ChangeAction,
    pub origin: Origin,
}

impl PixelChange {
    pub fn between(key: PixelKey, old: Option<Color>, new: Option<Color>, origin: Origin) -> Self {
        let action = match (old, new) {
            (None, _) => ChangeAction::Add,
            (Some(_), Some(_)) => ChangeAction::Update,
            (Some(_), None) => ChangeAction::Remove,
        };
        Self {
            key,
            old,
            new,
            action,
            origin,
        }
    }
}

/// Inclusive rectangle of sector-local coordinates that needs a repaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegion {
    pub sector: SectorCoord,
    pub min_x: u16,
    pub min_y: u16,
    pub max_x: u16,
    pub max_y: u16,
}

impl DirtyRegion {
    pub fn contains(&self, local: LocalCoord) -> bool {
        (self.min_x..=self.max_x).contains(&local.x())
            && (self.min_y..=self.max_y).contains(&local.y())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Rc<dyn Fn(&E) -> Result<(), SubscriberError>>;

/// Typed fan-out of events to subscribers.
///
/// A failing subscriber is logged and skipped; the remaining subscribers still run.
/// The subscriber list is snapshotted before dispatch, so handlers may subscribe or
/// unsubscribe while an event is being delivered.
pub struct EventBus<E> {
    subscribers: RefCell<Vec<(SubscriptionId, &'static str, Handler<E>)>>,
    next_id: Cell<u64>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        name: &'static str,
        handler: impl Fn(&E) -> Result<(), SubscriberError> + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(self.next_id.get().wrapping_add(1));
        self.subscribers
            .borrow_mut()
            .push((id, name, Rc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|(existing, _, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every subscriber. Returns how many failed.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<(&'static str, Handler<E>)> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, name, handler)| (*name, Rc::clone(handler)))
            .collect();

        let mut failures = 0;
        for (name, handler) in snapshot {
            if let Err(e) = handler(event) {
                failures += 1;
                warn!(subscriber = name, error = %e, "event subscriber failed");
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pixelgrid_shared::PixelKey;

    use super::{ChangeAction, EventBus, Origin, PixelChange};
    use crate::error::SubscriberError;

    #[test]
    fn failing_subscriber_does_not_block_others() {
        let bus = EventBus::<u32>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        bus.subscribe("broken", |_| Err(SubscriberError::new("broken", "boom")));
        let sink = Rc::clone(&seen);
        bus.subscribe("recorder", move |value| {
            sink.borrow_mut().push(*value);
            Ok(())
        });

        assert_eq!(bus.emit(&7), 1);
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::<u32>::new();
        let count = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&count);
        let id = bus.subscribe("counter", move |_| {
            *sink.borrow_mut() += 1;
            Ok(())
        });

        bus.emit(&1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&2);
        assert_eq!(*count.borrow(), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn handler_may_subscribe_during_dispatch() {
        let bus = Rc::new(EventBus::<u32>::new());
        let inner = Rc::clone(&bus);
        bus.subscribe("spawner", move |_| {
            inner.subscribe("late", |_| Ok(()));
            Ok(())
        });

        bus.emit(&0);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn change_action_follows_old_and_new() {
        let key = PixelKey::from_parts(0, 0, 1, 1).unwrap();
        assert_eq!(
            PixelChange::between(key, None, Some(1), Origin::Local).action,
            ChangeAction::Add
        );
        assert_eq!(
            PixelChange::between(key, Some(1), Some(2), Origin::Remote).action,
            ChangeAction::Update
        );
        assert_eq!(
            PixelChange::between(key, Some(1), None, Origin::Local).action,
            ChangeAction::Remove
        );
    }
}
