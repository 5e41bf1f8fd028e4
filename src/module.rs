//! Orchestrates the full load pipeline and owns the resulting image
//! (spec.md §4.8 "Module").

use crate::error::{LoadError, Result};
use crate::image::MappedImage;
use crate::platform::{self, ModuleHandle};
use crate::{export, import_binder, mapper, relocator, section_finalizer, tls};

/// `DllMain`'s signature: image base, attach/detach reason, reserved.
type DllEntryPoint = unsafe extern "system" fn(base: *mut u8, reason: u32, reserved: *mut u8) -> i32;

/// An EXE's entry point (`mainCRTStartup`-style): no arguments, returns
/// the process exit code. Distinct from [`DllEntryPoint`] — calling a
/// zero-argument entry through a 3-argument function pointer type would
/// misdescribe its actual calling convention and corrupt the stack.
type ExeEntryPoint = unsafe extern "system" fn() -> i32;

/// Optional load-time knobs. The only one the spec calls out: whether a
/// `DllMain` that returns `false` on attach should fail the load (the
/// default) or be tolerated.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    tolerate_attach_rejection: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            tolerate_attach_rejection: false,
        }
    }
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// If set, a `DllMain` returning `false` on `DLL_PROCESS_ATTACH` is
    /// treated as a successful (but uninitialized) load rather than an
    /// `AttachRejected` error.
    pub fn tolerate_attach_rejection(mut self, tolerate: bool) -> Self {
        self.tolerate_attach_rejection = tolerate;
        self
    }
}

/// A loaded PE image: the unique owner of its virtual-memory reservation
/// and imported-module handles.
pub struct Module {
    image: Option<MappedImage>,
}

impl Module {
    /// Run the full pipeline: map, relocate, bind imports, finalize
    /// section protections, run TLS callbacks, then attach (DLL) or store
    /// the entry point (EXE). Any failure tears down everything allocated
    /// so far before returning.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        Self::load_with_options(bytes, LoadOptions::default())
    }

    pub fn load_with_options(bytes: &[u8], options: LoadOptions) -> Result<Self> {
        let mut mapped = mapper::map(bytes)?;
        log::debug!(
            "mapped image at {:#x}, size {:#x}",
            mapped.base(),
            mapped.size_of_image()
        );

        let preferred_base = mapped.optional_header().image_base();
        let delta = (mapped.base() as u64).wrapping_sub(preferred_base);

        let result = Self::finish_load(&mut mapped, delta, options);
        match result {
            Ok(()) => Ok(Module { image: Some(mapped) }),
            Err(err) => {
                teardown(&mut mapped);
                Err(err)
            }
        }
    }

    fn finish_load(mapped: &mut MappedImage, delta: u64, options: LoadOptions) -> Result<()> {
        mapped.relocated = relocator::apply(mapped, delta)?;
        if !mapped.relocated {
            return Err(LoadError::BadImageFormat(
                "image requires relocation but has no relocation directory",
            ));
        }

        let handles = import_binder::bind(mapped)?;
        mapped.imported_modules = handles;
        log::debug!("bound {} imported modules", mapped.imported_modules.len());

        section_finalizer::finalize(mapped)?;
        tls::run(mapped, tls::DLL_PROCESS_ATTACH)?;

        if mapped.is_dll() && mapped.entry() != 0 {
            let entry: DllEntryPoint = unsafe { std::mem::transmute(mapped.entry()) };
            let attached =
                unsafe { entry(mapped.base() as *mut u8, tls::DLL_PROCESS_ATTACH, std::ptr::null_mut()) };
            if attached == 0 {
                if options.tolerate_attach_rejection {
                    mapped.initialized = false;
                } else {
                    return Err(LoadError::AttachRejected);
                }
            } else {
                mapped.initialized = true;
            }
        } else if !mapped.is_dll() {
            // EXEs have no attach step; the entry is stored for call_entry().
            mapped.initialized = true;
        }

        Ok(())
    }

    /// Invoke the EXE's stored entry point. Only valid for a relocated EXE
    /// image with a non-null entry.
    pub fn call_entry(&self) -> Result<i32> {
        let image = self.image()?;
        if image.is_dll() || !image.relocated() || image.entry() == 0 {
            return Err(LoadError::InvalidState(
                "call_entry is only valid for a relocated EXE with an entry point",
            ));
        }
        let entry: ExeEntryPoint = unsafe { std::mem::transmute(image.entry()) };
        Ok(unsafe { entry() })
    }

    /// Resolve `name` in this module's own export table. Only valid for a
    /// DLL after successful initialization.
    pub fn get_function(&self, name: &str) -> Result<usize> {
        let image = self.image()?;
        if !image.is_dll() || !image.initialized() {
            return Err(LoadError::InvalidState(
                "get_function is only valid for an initialized DLL",
            ));
        }
        Ok(export::resolve_own_export(image.base(), name)?)
    }

    /// Like [`get_function`](Self::get_function), but transmutes the
    /// resolved address to the caller-chosen function-pointer type. The
    /// caller is responsible for `Sig` matching the export's true ABI.
    ///
    /// # Safety
    /// `Sig` must be a function-pointer type whose calling convention and
    /// signature exactly match the resolved export.
    pub unsafe fn get_function_typed<Sig: Copy>(&self, name: &str) -> Result<Sig> {
        let addr = self.get_function(name)?;
        Ok(std::mem::transmute_copy(&addr))
    }

    fn image(&self) -> Result<&MappedImage> {
        self.image
            .as_ref()
            .ok_or(LoadError::InvalidState("module has been disposed"))
    }

    /// Idempotent teardown: detach (if initialized), free imported
    /// modules, release the image reservation.
    pub fn dispose(&mut self) {
        if let Some(mut image) = self.image.take() {
            teardown(&mut image);
        }
    }
}

fn teardown(mapped: &mut MappedImage) {
    if mapped.initialized() && mapped.is_dll() && mapped.entry() != 0 {
        let entry: DllEntryPoint = unsafe { std::mem::transmute(mapped.entry()) };
        unsafe { entry(mapped.base() as *mut u8, tls::DLL_PROCESS_DETACH, std::ptr::null_mut()) };
    }
    for handle in mapped.imported_modules.drain(..) {
        free_handle(handle);
    }
    if mapped.base() != 0 {
        platform::free_image(mapped.base());
        mapped.base = 0;
    }
    mapped.initialized = false;
}

fn free_handle(handle: ModuleHandle) {
    platform::free_library(handle);
}

impl Drop for Module {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_options_default_rejects_failed_attach() {
        assert!(!LoadOptions::default().tolerate_attach_rejection);
    }

    #[test]
    fn load_options_builder_sets_tolerance() {
        let opts = LoadOptions::new().tolerate_attach_rejection(true);
        assert!(opts.tolerate_attach_rejection);
    }
}
