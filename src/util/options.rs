use crate::util::constants::*;
use std::default::Default;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Which collector a heap runs.
#[derive(Copy, Clone, EnumString, Display, Debug, PartialEq, Eq)]
pub enum CollectorSelector {
    /// Stop-the-world mark-sweep over the segregated free list.
    MarkSweep,
    /// Stop-the-world copying collector with age-based promotion.
    Generational,
    /// On-the-fly mark-sweep with background marker and sweeper threads.
    Concurrent,
}

/// The lock protecting the page table and the free-region index.
#[derive(Copy, Clone, EnumString, Display, Debug, PartialEq, Eq)]
pub enum PageLockKind {
    /// A spin lock when more than one core may contend, a blocking mutex otherwise.
    Auto,
    Spin,
    Blocking,
}

impl PageLockKind {
    /// Resolve `Auto` for the machine we run on.
    pub fn resolve(self) -> PageLockKind {
        match self {
            PageLockKind::Auto if num_cpus::get() > 1 => PageLockKind::Spin,
            PageLockKind::Auto => PageLockKind::Blocking,
            other => other,
        }
    }
}

/// How the generational collector finds old-to-young pointers.
#[derive(Copy, Clone, EnumString, Display, Debug, PartialEq, Eq)]
pub enum RemsetKind {
    /// A per-thread store buffer of written slots, flushed into a remembered set.
    RememberedSet,
    /// One dirty byte per card, set on every reference store.
    AllCards,
}

/// The default heap size.
pub const DEFAULT_HEAP_SIZE: usize = 256 << LOG_BYTES_IN_MBYTE;
/// The default number of bytes allocated between two mark-sweep collections.
pub const DEFAULT_TRIGGER_BYTES: usize = 8 << LOG_BYTES_IN_MBYTE;
/// The default nursery size of the generational collector.
pub const DEFAULT_NURSERY_SIZE: usize = 4 << LOG_BYTES_IN_MBYTE;

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Tunables of a heap. Every option has a type, a validator and a default.
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// Set an option by its snake case name. Returns false and keeps the old
            /// value if the name is unknown, or the value cannot be parsed or is invalid.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by the heap builder) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            /// The built-in default of every option, ignoring the environment.
            pub fn builtin() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options::builtin();

                // Env vars that start with RTGC_ and match an option (such as RTGC_HEAP_SIZE)
                // override the default if their value is valid.
                const PREFIX: &str = "RTGC_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // The collector to use.
    collector:                 CollectorSelector [always_valid] = CollectorSelector::MarkSweep,
    // Bytes of virtual memory reserved for the heap. Rounded up to whole pages.
    heap_size:                 usize             [|v: &usize| *v >= 64 * BYTES_IN_PAGE] = DEFAULT_HEAP_SIZE,
    // The lock protecting the page manager.
    page_lock:                 PageLockKind      [always_valid] = PageLockKind::Auto,
    // The number of slots in the thread table.
    max_threads:               usize             [|v: &usize| *v >= 1 && *v <= u16::MAX as usize] = 256,
    // Mark-sweep collects after this many bytes were allocated since the last collection.
    ms_trigger_bytes:          usize             [|v: &usize| *v > 0] = DEFAULT_TRIGGER_BYTES,
    // Bytes the generational nursery may grow to before a young collection.
    nursery_size:              usize             [|v: &usize| *v >= BYTES_IN_PAGE] = DEFAULT_NURSERY_SIZE,
    // Pages per bump allocation chunk.
    nursery_chunk_pages:       usize             [|v: &usize| *v >= 1] = 8,
    // Pages of from-space kept back after a young collection to refill nursery chunks.
    nursery_reserve_pages:     usize             [always_valid] = 64,
    // The oldest generation. The nursery is generation 0.
    max_generation:            u8                [|v: &u8| *v >= 1 && *v <= 6] = 2,
    // A generation is collected after this many collections of the next younger one.
    generation_trigger_count:  usize             [|v: &usize| *v >= 1] = 4,
    // A generation is collected when it holds more than this many pages.
    generation_budget_pages:   usize             [|v: &usize| *v >= 1] = 4096,
    // Objects at least this large skip the nursery and go to the oldest generation.
    pretenure_threshold_bytes: usize             [|v: &usize| *v >= MIN_OBJECT_BYTES] = 64 << LOG_BYTES_IN_KBYTE,
    // How the generational write barrier records old-to-young pointers.
    generational_barrier:      RemsetKind        [always_valid] = RemsetKind::RememberedSet,
    // The concurrent collector starts a cycle after this many bytes were allocated.
    concurrent_trigger_bytes:  usize             [|v: &usize| *v > 0] = DEFAULT_TRIGGER_BYTES,
    // Background threads tracing for the concurrent collector.
    concurrent_marker_threads: usize             [|v: &usize| *v >= 1] = 1,
    // Run a full heap verification after each collection.
    verify_after_gc:           bool              [always_valid] = false,
}

impl Options {
    /// Set options from a space-separated list of `name=value` pairs, as a
    /// runtime would pass them on its command line. Every pair is attempted;
    /// the result is false if any of them failed.
    pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
        let mut all_ok = true;
        for opt in options.split_ascii_whitespace() {
            let kv: Vec<&str> = opt.splitn(2, '=').collect();
            if kv.len() != 2 {
                warn!("Malformed option {:?}", opt);
                all_ok = false;
                continue;
            }
            all_ok &= self.set_from_str(kv[0], kv[1]);
        }
        all_ok
    }

    /// Set an option by a camel case name (`heapSize`), the form a managed
    /// runtime's configuration keys usually take.
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        self.set_from_str(sr.as_str(), val)
    }
}

impl FromStr for Options {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Options::builtin();
        if options.set_bulk_from_str(s) {
            Ok(options)
        } else {
            Err(format!("invalid options: {}", s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.heap_size, DEFAULT_HEAP_SIZE);
            assert_eq!(options.collector, CollectorSelector::MarkSweep);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("RTGC_MAX_GENERATION", "4");
                    std::env::set_var("RTGC_COLLECTOR", "Generational");

                    let options = Options::default();
                    assert_eq!(options.max_generation, 4);
                    assert_eq!(options.collector, CollectorSelector::Generational);
                },
                || {
                    std::env::remove_var("RTGC_MAX_GENERATION");
                    std::env::remove_var("RTGC_COLLECTOR");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // out of range, so the default is kept
                    std::env::set_var("RTGC_MAX_GENERATION", "9");
                    std::env::set_var("RTGC_PAGE_LOCK", "Ticket");

                    let options = Options::default();
                    assert_eq!(options.max_generation, 2);
                    assert_eq!(options.page_lock, PageLockKind::Auto);
                },
                || {
                    std::env::remove_var("RTGC_MAX_GENERATION");
                    std::env::remove_var("RTGC_PAGE_LOCK");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_key() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("RTGC_ABC", "42");
                    let options = Options::default();
                    assert_eq!(options.heap_size, DEFAULT_HEAP_SIZE);
                },
                || {
                    std::env::remove_var("RTGC_ABC");
                },
            )
        })
    }

    #[test]
    fn bulk_and_camelcase() {
        let mut options = Options::builtin();
        assert!(options.set_bulk_from_str("collector=Concurrent concurrent_marker_threads=2"));
        assert_eq!(options.collector, CollectorSelector::Concurrent);
        assert_eq!(options.concurrent_marker_threads, 2);

        assert!(options.set_from_camelcase_str("nurseryChunkPages", "16"));
        assert_eq!(options.nursery_chunk_pages, 16);

        assert!(!options.set_bulk_from_str("heap_size=1 bogus"));
        assert_eq!(options.heap_size, DEFAULT_HEAP_SIZE);
    }

    #[test]
    fn parse_whole_option_string() {
        let options: Options = "verify_after_gc=true generational_barrier=AllCards"
            .parse()
            .unwrap();
        assert!(options.verify_after_gc);
        assert_eq!(options.generational_barrier, RemsetKind::AllCards);
        assert!("no_such_option=1".parse::<Options>().is_err());
    }

    #[test]
    fn page_lock_resolves() {
        assert_ne!(PageLockKind::Auto.resolve(), PageLockKind::Auto);
        assert_eq!(PageLockKind::Blocking.resolve(), PageLockKind::Blocking);
    }
}
