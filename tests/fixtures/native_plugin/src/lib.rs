//! Native module used by the integration tests.
//!
//! Declares three `Greeter` exports through the embedded manifest: one that
//! constructs, one whose entry point is absent, and one whose entry point
//! returns null.

use lazyplug::{Extension, export_extension};
use std::any::Any;
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

const MANIFEST: &str = concat!(
    r#"{"schema_version":"lazyplug_manifest_v1","exports":["#,
    r#"{"name":"Greeter","entry_point":"greeter_create","metadata":{"Name":"Greeter","Language":"en"}},"#,
    r#"{"name":"Greeter","entry_point":"greeter_missing","metadata":{"Name":"Ghost"}},"#,
    r#"{"name":"Greeter","entry_point":"greeter_null","metadata":{"Name":"Null"}}"#,
    r#"]}"#,
    "\0"
);

#[unsafe(no_mangle)]
pub extern "C" fn lazyplug_manifest() -> *const c_char {
    MANIFEST.as_ptr().cast()
}

struct Greeter {
    greeted: AtomicUsize,
}

impl Extension for Greeter {
    fn initialize(&self) {
        self.greeted.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn greeter_create() -> *mut c_void {
    export_extension(Box::new(Greeter {
        greeted: AtomicUsize::new(0),
    }))
}

#[unsafe(no_mangle)]
pub extern "C" fn greeter_null() -> *mut c_void {
    std::ptr::null_mut()
}
