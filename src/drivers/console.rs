//! The output console seam. Syscall handlers print through whatever the
//! platform installed; nothing in the core depends on a concrete device.

use alloc::string::String;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

pub trait Console: Send + Sync {
    fn write(&self, text: &str);
    fn put_byte(&self, byte: u8);
    fn clear(&self);
}

lazy_static! {
    static ref CONSOLE: Mutex<Option<Arc<dyn Console>>> = Mutex::new(None);
}

/// Install the platform console. Replaces any previous one.
pub fn install(console: Arc<dyn Console>) {
    *CONSOLE.lock() = Some(console);
}

/// Run `f` against the installed console; silently a no-op without one.
pub fn with_console(f: impl FnOnce(&dyn Console)) {
    if let Some(console) = CONSOLE.lock().clone() {
        f(&*console);
    }
}

/// Captures output in memory; the console used by hosted tests.
#[derive(Default)]
pub struct BufferConsole {
    buffer: Mutex<String>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }
}

impl Console for BufferConsole {
    fn write(&self, text: &str) {
        self.buffer.lock().push_str(text);
    }

    fn put_byte(&self, byte: u8) {
        self.buffer.lock().push(byte as char);
    }

    fn clear(&self) {
        self.buffer.lock().clear();
    }
}
