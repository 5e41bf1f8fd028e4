//! Thread-local-storage callback invocation (spec.md §4.6 "TlsRunner").

use crate::error::Result;
use crate::image::MappedImage;
use crate::pe::headers::{TlsDirectory32, TlsDirectory64, DIR_TLS};
use crate::pe::view;

/// `DLL_PROCESS_ATTACH`, passed to every TLS callback in order.
pub const DLL_PROCESS_ATTACH: u32 = 1;
/// `DLL_PROCESS_DETACH`, used only by [`crate::module::Module::dispose`].
pub const DLL_PROCESS_DETACH: u32 = 0;

type TlsCallback = unsafe extern "system" fn(base: *mut u8, reason: u32, reserved: *mut u8);

/// Run every TLS callback for `reason`, in array order. A zero TLS
/// directory RVA is not an error — most images have none.
pub fn run(mapped: &MappedImage, reason: u32) -> Result<()> {
    let tls_dir = match mapped.data_directory(DIR_TLS) {
        Some(d) if d.virtual_address != 0 => d,
        _ => return Ok(()),
    };

    let base = mapped.base();
    let dir_addr = view::rva_to_va(base, tls_dir.virtual_address);

    let callbacks_va = if cfg!(target_pointer_width = "64") {
        let dir: TlsDirectory64 = unsafe { view::read_in_memory(dir_addr) };
        dir.address_of_call_backs as usize
    } else {
        let dir: TlsDirectory32 = unsafe { view::read_in_memory(dir_addr) };
        dir.address_of_call_backs as usize
    };

    if callbacks_va == 0 {
        return Ok(());
    }

    let mut slot = callbacks_va;
    let ptr_size = std::mem::size_of::<usize>();
    loop {
        let callback_addr: usize = unsafe { view::read_in_memory(slot) };
        if callback_addr == 0 {
            break;
        }
        let callback: TlsCallback = unsafe { std::mem::transmute(callback_addr) };
        unsafe { callback(base as *mut u8, reason, std::ptr::null_mut()) };
        slot += ptr_size;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static CALLS: AtomicU32 = AtomicU32::new(0);

    unsafe extern "system" fn fake_callback(_base: *mut u8, _reason: u32, _reserved: *mut u8) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn callback_pointer_is_callable() {
        CALLS.store(0, Ordering::SeqCst);
        let f: TlsCallback = fake_callback;
        unsafe { f(std::ptr::null_mut(), DLL_PROCESS_ATTACH, std::ptr::null_mut()) };
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
