use super::{default_illegal_handler, Exception, FunctionHandler, FUNC_CODE_MAX, FUNC_NONE};
use crate::error::{ModbusError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Default number of handler slots
pub const FUNC_HANDLERS_MAX: usize = 16;

#[derive(Clone, Default)]
struct Slot {
    code: u8,
    handler: Option<FunctionHandler>,
}

/// Fixed-capacity function code to handler table.
///
/// Slots are scanned in order. Code 0 marks an empty slot and terminates a
/// dispatch scan, so a handler registered behind a hole left by an
/// unregistration is unreachable until the hole is filled again.
/// Registration and dispatch take the same lock.
pub struct FunctionTable<const N: usize = FUNC_HANDLERS_MAX> {
    slots: Mutex<[Slot; N]>,
    illegal: Mutex<FunctionHandler>,
}

impl<const N: usize> Default for FunctionTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FunctionTable<N> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| Slot::default())),
            illegal: Mutex::new(default_illegal_handler()),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Binds `code` to `handler`, or unbinds `code` when `handler` is `None`.
    ///
    /// Codes stay unique: a slot already bound to `code` gets the new
    /// handler in place. Otherwise the handler takes the first slot that
    /// already holds the same handler, so registering one handler under a
    /// second code moves it, or else the first empty slot.
    pub fn register(&self, code: u8, handler: Option<FunctionHandler>) -> Result<()> {
        if code == FUNC_NONE || code > FUNC_CODE_MAX {
            return Err(ModbusError::InvalidArgument);
        }

        let mut slots = self.slots.lock();
        match handler {
            Some(handler) => {
                let index = slots
                    .iter()
                    .position(|slot| slot.handler.is_some() && slot.code == code)
                    .or_else(|| {
                        slots.iter().position(|slot| {
                            slot.handler
                                .as_ref()
                                .is_some_and(|existing| Arc::ptr_eq(existing, &handler))
                        })
                    })
                    .or_else(|| slots.iter().position(|slot| slot.handler.is_none()));
                match index {
                    Some(i) => {
                        slots[i] = Slot {
                            code,
                            handler: Some(handler),
                        };
                        Ok(())
                    }
                    None => Err(ModbusError::ResourceExhausted),
                }
            }
            None => {
                // Removing an unknown code is not an error.
                if let Some(slot) = slots.iter_mut().find(|slot| slot.code == code) {
                    *slot = Slot::default();
                }
                Ok(())
            }
        }
    }

    /// Sets the handler invoked when no registered code matches
    pub fn register_illegal(&self, handler: FunctionHandler) {
        *self.illegal.lock() = handler;
    }

    /// Looks up `code` and invokes its handler with the PDU and its length.
    pub fn dispatch(&self, code: u8, pdu: &mut [u8], len: &mut usize) -> Exception {
        let handler = self.lookup(code);
        let handler = match handler {
            Some(handler) => handler,
            None => {
                debug!("No handler for function code {:#04x}", code);
                self.illegal.lock().clone()
            }
        };
        // The lock is released here so a handler may register or unregister.
        handler(pdu, len)
    }

    fn lookup(&self, code: u8) -> Option<FunctionHandler> {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if slot.code == FUNC_NONE {
                return None;
            }
            if slot.code == code {
                return slot.handler.clone();
            }
        }
        None
    }

    /// Function codes in slot order, 0 for empty slots
    pub fn codes(&self) -> Vec<u8> {
        self.slots.lock().iter().map(|slot| slot.code).collect()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.handler.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
