use core::cell::RefCell;

use critical_section::Mutex;
use esp_hal::gpio::{AnyPin, Event, Input, InputConfig, Io, Pull};
use esp_hal::handler;
use lora_mqtt_gateway::gpio::{GpioEvent, LevelReader};

use crate::GPIO_EVENTS;

/// The button input, shared with the interrupt handler.
static BUTTON: Mutex<RefCell<Option<(u8, Input<'static>)>>> = Mutex::new(RefCell::new(None));

/// Arms a falling-edge interrupt on `pin` and routes it to [`GPIO_EVENTS`].
pub fn arm(io: &mut Io<'static>, pin: AnyPin<'static>, line: u8) {
    io.set_interrupt_handler(on_edge);
    let mut button = Input::new(pin, InputConfig::default().with_pull(Pull::Up));
    critical_section::with(|cs| {
        button.listen(Event::FallingEdge);
        BUTTON.borrow_ref_mut(cs).replace((line, button));
    });
}

#[handler]
fn on_edge() {
    critical_section::with(|cs| {
        let mut button = BUTTON.borrow_ref_mut(cs);
        let Some((line, input)) = button.as_mut() else {
            return;
        };
        if input.is_interrupt_set() {
            GPIO_EVENTS.push_from_isr(GpioEvent {
                line: *line,
                level: input.is_high(),
            });
            input.clear_interrupt();
        }
    });
}

/// Reads the armed button line.
pub struct ButtonLevel;

impl LevelReader for ButtonLevel {
    fn level(&self, line: u8) -> bool {
        critical_section::with(|cs| match BUTTON.borrow_ref(cs).as_ref() {
            Some((armed, input)) if *armed == line => input.is_high(),
            _ => false,
        })
    }
}
