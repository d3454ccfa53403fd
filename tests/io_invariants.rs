//! Invariants 2-4 of the layered-handle/soft-event contract, exercised
//! through `Io` directly rather than at the queue level: terminal events
//! end a handle's stream for good (even across two different layers'
//! independently-queued events), same-turn coalescing collapses repeated
//! enqueues on one layer, and delivery order across event kinds always
//! follows `CONNECTED, ACCEPT, READ, DISCONNECTED, ERROR, WRITE, OTHER`.

mod common;

use relayio::{EventType, Io, Layer, LayerContext};

use common::FakeBase;

/// A layer that, on seeing `trigger` pass through as a hard/bubbled event,
/// enqueues `emit` on its own soft-event queue and swallows `trigger` so it
/// never reaches the layers above -- the same "suppress one event,
/// synthesize another" shape the PROXY protocol layers use, generalized so
/// two independent layers can each seed their own queue in one dispatch
/// call without coalescing against each other.
struct TriggeredInjector {
    trigger: EventType,
    emit: Vec<EventType>,
}

impl Layer for TriggeredInjector {
    fn process_event(&mut self, ctx: &mut LayerContext<'_>, event_type: &mut EventType) -> bool {
        if *event_type != self.trigger {
            return true;
        }
        for event in self.emit.drain(..) {
            ctx.softevent_add(true, event, None);
        }
        false
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn io_with(layers: Vec<(EventType, Vec<EventType>)>) -> Io {
    let mut io = Io::new("fake", Box::new(FakeBase::new(&[]))).unwrap();
    for (trigger, emit) in layers {
        io.push_layer("injector", Box::new(TriggeredInjector { trigger, emit })).unwrap();
    }
    io
}

#[test]
fn invariant_no_event_delivered_after_the_first_terminal_event() {
    // Two independent layers, each seeding its own queue on a different
    // trigger: a lower layer queues a non-terminal `Write`, a higher layer
    // queues a terminal `Error`. Nothing coalesces them against each other
    // before they reach `Io::dispatch_soft_events`, so the cross-layer
    // priority sort is what must stop `Write` from following `Error`.
    let mut io = io_with(vec![(EventType::Other, vec![EventType::Write]), (EventType::Read, vec![EventType::Error])]);

    io.dispatch_hard_event(EventType::Other);
    io.dispatch_hard_event(EventType::Read);

    let events = io.dispatch_soft_events();
    assert_eq!(events, vec![EventType::Error]);

    // A later turn, even with nothing new queued, delivers nothing: the
    // handle remembers it already terminated.
    assert!(io.dispatch_soft_events().is_empty());
    assert_eq!(io.dispatch_hard_event(EventType::Connected), None);
}

#[test]
fn invariant_n_enqueues_of_read_collapse_to_one_delivery() {
    let mut io = io_with(vec![(
        EventType::Other,
        vec![EventType::Read, EventType::Read, EventType::Read, EventType::Read, EventType::Read],
    )]);

    io.dispatch_hard_event(EventType::Other);

    let events = io.dispatch_soft_events();
    assert_eq!(events, vec![EventType::Read]);
}

#[test]
fn invariant_same_turn_events_deliver_in_priority_order() {
    let mut io = io_with(vec![(
        EventType::Other,
        vec![EventType::Other, EventType::Read, EventType::Accept, EventType::Connected],
    )]);

    io.dispatch_hard_event(EventType::Other);

    let events = io.dispatch_soft_events();
    assert_eq!(
        events,
        vec![EventType::Connected, EventType::Accept, EventType::Read, EventType::Other]
    );
}
