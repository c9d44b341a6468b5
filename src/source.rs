//! A `BreakSource` is responsible for extending the data segment that
//! backs a heap.  Each `Growth` adapter is parameterised on such a
//! source.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::fence::ALIGNMENT;
use crate::sys;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait BreakSource: std::fmt::Debug + Sync {
    /// Returns the growth granularity for this source.  Every request
    /// passed to `grow` is a multiple of this page size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Extends the backing segment by `bytes` and returns the first
    /// byte of the new region.
    ///
    /// The returned address must be `ALIGNMENT`-aligned, and
    /// successive calls must return contiguous regions: each region
    /// starts exactly where the previous one ended.  The program break
    /// behaves this way as long as nothing else moves it.
    #[requires(bytes > 0 && bytes % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % ALIGNMENT == 0,
              "New regions keep payloads aligned")]
    fn grow(&self, bytes: usize) -> Result<NonNull<c_void>, i32>;
}

/// Extends the real program break via `sbrk`.
#[derive(Debug)]
struct DefaultSource {}

lazy_static::lazy_static! {
    static ref NAMED_SOURCES: Mutex<HashMap<String, &'static dyn BreakSource>> =
        Default::default();
}

/// Upserts the break source associated with `name`.
pub fn register_break_source(name: String, source: &'static dyn BreakSource) {
    let mut sources = NAMED_SOURCES.lock().unwrap();

    sources.insert(name, source);
}

/// Returns the source for the given `name`, if one exists, or the
/// default sbrk-backed source if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such source is defined.
pub fn get_break_source(name: Option<&str>) -> Result<&'static dyn BreakSource, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_SOURCE: DefaultSource = DefaultSource {};
    }

    match name {
        Some(key) => {
            let sources = NAMED_SOURCES.lock().unwrap();

            Ok(*sources.get(key).ok_or("Break source not found")?)
        }
        None => Ok(&*DEFAULT_SOURCE),
    }
}

#[contract_trait]
impl BreakSource for DefaultSource {
    fn page_size(&self) -> usize {
        sys::page_size()
    }

    fn grow(&self, bytes: usize) -> Result<NonNull<c_void>, i32> {
        // Pad the request so the region starts on an aligned boundary
        // even when something else left the break misaligned.
        let pad = sys::current_break().wrapping_neg() % ALIGNMENT;
        let base = sys::extend_break(bytes + pad)?;

        Ok(
            NonNull::new((base.as_ptr() as usize + pad) as *mut c_void)
                .expect("padded break is never null"),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena_source::ArenaSource;

    #[test]
    fn registry_round_trip() {
        let arena = Box::leak(Box::new(ArenaSource::new(4096)));
        register_break_source("registry_arena".to_string(), arena);

        let found = get_break_source(Some("registry_arena")).expect("was registered");
        assert_eq!(found.page_size(), arena.page_size());

        assert!(get_break_source(Some("no_such_source")).is_err());
        assert!(get_break_source(None).is_ok());
    }
}
