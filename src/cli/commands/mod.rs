// Command handlers for the deptnet binary
// Each handler drives one reconciler operation and renders its result.

pub mod common;
pub mod department;
pub mod inspect;
pub mod network;

pub use department::{handle_add, handle_list, handle_next_subnet, handle_remove};
pub use inspect::{handle_capture, handle_diagnose};
pub use network::{
    handle_configure, handle_destroy, handle_restart_dhcp, handle_restore, handle_settings,
};
