//! Dropping to the unprivileged daemon identity.
//!
//! Runs once at startup, before any child is spawned; children inherit
//! the reduced identity.

use std::io;

/// Drop supplementary groups, then the gid, then the uid.
pub fn drop_privileges(uid: u32, gid: u32) -> io::Result<()> {
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(io::Error::last_os_error());
        }
        // Gid first; it cannot change after the uid drops.
        if libc::setregid(gid, gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setreuid(uid, uid) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
