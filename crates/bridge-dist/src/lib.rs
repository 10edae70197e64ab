#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)] // See arti#1765
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod area;
mod email;
mod err;
mod https;
mod proxies;
mod schedule;
mod storage;

pub use area::{uniform_map, uniform_mapper, AreaMapper};
pub use email::{
    normalize_email, DomainRule, EmailAddress, EmailDistributor, MAX_EMAIL_RATE,
};
pub use err::Error;
pub use https::IpDistributor;
pub use proxies::ProxyCategory;
pub use schedule::IntervalSchedule;
pub use storage::{Database, StorageTx, StoreTracker};

use tracing::debug;

/// Wrapper type for Results returned from this crate.
type Result<T> = std::result::Result<T, crate::Error>;

/// Decide how many bridges a ring of `ring_len` bridges may answer with,
/// given that the requester asked for at most `n`.
///
/// Small rings answer with a single bridge and mid-sized rings with at
/// most two, so that a sparsely populated deployment is not enumerated
/// in a handful of requests.
pub(crate) fn num_bridges_per_answer(ring_len: usize, n: usize) -> usize {
    let capped = if ring_len < 20 {
        1
    } else if ring_len < 100 {
        n.min(2)
    } else {
        n
    };
    debug!("returning {} bridges from ring of len {}", capped, ring_len);
    capped
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn answer_size_cap() {
        assert_eq!(num_bridges_per_answer(0, 3), 1);
        assert_eq!(num_bridges_per_answer(19, 3), 1);
        assert_eq!(num_bridges_per_answer(20, 3), 2);
        assert_eq!(num_bridges_per_answer(99, 1), 1);
        assert_eq!(num_bridges_per_answer(100, 3), 3);
        assert_eq!(num_bridges_per_answer(5000, 10), 10);
    }
}
