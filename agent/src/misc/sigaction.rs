//! Scoped signal handler installation
//!
//! A [`SigAction`] owns one signal disposition. Installing requires the
//! signal to be at its default or ignored disposition; both installing and
//! restoring re-read the disposition they replaced and back out if somebody
//! else changed it in between. Restoring passes through `SIG_IGN` first, so
//! instances still pending can't hit the default action and kill the process.

use crate::error::{AgentError, Result};
use nix::errno::Errno;
use std::mem::MaybeUninit;
use std::ptr;
use tracing::warn;

/// Handler taking only the signal number
pub type PlainHandler = extern "C" fn(libc::c_int);

/// Handler taking the full `siginfo_t`
pub type InfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Build a disposition for a plain handler
pub fn plain_action(handler: PlainHandler, mask: &[libc::c_int], flags: libc::c_int) -> libc::sigaction {
    build_action(handler as libc::sighandler_t, mask, flags)
}

/// Build a disposition for a `SA_SIGINFO` handler
pub fn info_action(handler: InfoHandler, mask: &[libc::c_int], flags: libc::c_int) -> libc::sigaction {
    build_action(handler as libc::sighandler_t, mask, flags | libc::SA_SIGINFO)
}

fn build_action(handler: libc::sighandler_t, mask: &[libc::c_int], flags: libc::c_int) -> libc::sigaction {
    // SAFETY: sigaction is plain data; all-zero is a valid empty value
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = flags;
    // SAFETY: sa_mask is a valid sigset_t owned by `action`
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        for &signum in mask {
            libc::sigaddset(&mut action.sa_mask, signum);
        }
    }
    action
}

fn query(signum: libc::c_int) -> Result<libc::sigaction> {
    let mut current = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null new action only reads the disposition into `current`
    let rc = unsafe { libc::sigaction(signum, ptr::null(), current.as_mut_ptr()) };
    Errno::result(rc).map_err(|e| AgentError::sys("sigaction()", e))?;
    // SAFETY: initialised by the successful call above
    Ok(unsafe { current.assume_init() })
}

fn same_handler(a: &libc::sigaction, b: &libc::sigaction) -> bool {
    a.sa_sigaction == b.sa_sigaction
}

/// Replace `expected` with `new`, checking before and after the swap
fn swap_actions(
    signum: libc::c_int,
    new: &libc::sigaction,
    expected: &libc::sigaction,
    check_first: bool,
) -> Result<()> {
    if check_first {
        let current = query(signum)?;
        if !same_handler(&current, expected) {
            return Err(AgentError::HandlerChanged { signal: signum });
        }
    }

    let mut replaced = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: both pointers reference valid sigaction values
    let rc = unsafe { libc::sigaction(signum, new, replaced.as_mut_ptr()) };
    Errno::result(rc).map_err(|e| AgentError::sys("sigaction()", e))?;
    // SAFETY: initialised by the successful call above
    let replaced = unsafe { replaced.assume_init() };

    // Somebody swapped the handler between the check and the install
    if !same_handler(&replaced, expected) {
        // SAFETY: puts back the disposition we just displaced
        unsafe { libc::sigaction(signum, &replaced, ptr::null_mut()) };
        return Err(AgentError::HandlerChanged { signal: signum });
    }

    Ok(())
}

/// An installed signal disposition, restored on release or drop
pub struct SigAction {
    signum: libc::c_int,
    action: libc::sigaction,
    previous: libc::sigaction,
    installed: bool,
}

impl SigAction {
    /// Install `action` for `signum`
    pub fn install(signum: libc::c_int, action: libc::sigaction) -> Result<Self> {
        let previous = query(signum)?;
        if previous.sa_sigaction != libc::SIG_DFL && previous.sa_sigaction != libc::SIG_IGN {
            return Err(AgentError::HandlerBusy { signal: signum });
        }

        swap_actions(signum, &action, &previous, false)?;

        Ok(Self {
            signum,
            action,
            previous,
            installed: true,
        })
    }

    pub fn signum(&self) -> libc::c_int {
        self.signum
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Restore the disposition that was in place before `install`
    pub fn release(&mut self) -> Result<()> {
        if !self.installed {
            return Ok(());
        }
        self.installed = false;
        // Ignoring a signal discards its pending instances on every thread
        let ignore = build_action(libc::SIG_IGN, &[], 0);
        swap_actions(self.signum, &ignore, &self.action, true)?;
        swap_actions(self.signum, &self.previous, &ignore, false)
    }
}

impl Drop for SigAction {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to restore handler of signal {}: {}", self.signum, e);
        }
    }
}

impl std::fmt::Debug for SigAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigAction")
            .field("signum", &self.signum)
            .field("installed", &self.installed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_: libc::c_int) {}

    extern "C" fn noop_info(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

    fn disposition(signum: libc::c_int) -> libc::sighandler_t {
        query(signum).unwrap().sa_sigaction
    }

    // Each test owns a distinct real-time signal so they can run in parallel

    #[test]
    fn test_install_and_release() {
        let signum = libc::SIGRTMAX() - 1;
        let mut action = SigAction::install(signum, plain_action(noop, &[], libc::SA_RESTART)).unwrap();
        assert!(action.is_installed());
        assert_eq!(disposition(signum), noop as libc::sighandler_t);

        action.release().unwrap();
        assert!(!action.is_installed());
        assert_eq!(disposition(signum), libc::SIG_DFL);

        // Second release is a no-op
        action.release().unwrap();
    }

    #[test]
    fn test_install_over_foreign_handler_fails() {
        let signum = libc::SIGRTMAX() - 2;
        let first = SigAction::install(signum, info_action(noop_info, &[signum], 0)).unwrap();
        let second = SigAction::install(signum, plain_action(noop, &[], 0));
        assert!(matches!(second, Err(AgentError::HandlerBusy { .. })));
        drop(first);
        assert_eq!(disposition(signum), libc::SIG_DFL);
    }

    #[test]
    fn test_release_discards_pending_signal() {
        let signum = libc::SIGRTMAX() - 4;
        let mut action = SigAction::install(signum, plain_action(noop, &[], 0)).unwrap();

        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut pending: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signum);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
            libc::raise(signum);
            libc::sigpending(&mut pending);
        }
        assert_eq!(unsafe { libc::sigismember(&pending, signum) }, 1);

        action.release().unwrap();
        assert_eq!(disposition(signum), libc::SIG_DFL);
        unsafe { libc::sigpending(&mut pending) };
        assert_eq!(unsafe { libc::sigismember(&pending, signum) }, 0);

        // Nothing left to deliver at the default action
        unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()) };
    }

    #[test]
    fn test_release_detects_changed_handler() {
        let signum = libc::SIGRTMAX() - 3;
        let mut action = SigAction::install(signum, plain_action(noop, &[], 0)).unwrap();

        // Someone else replaces our handler behind our back
        let foreign = info_action(noop_info, &[], 0);
        unsafe { libc::sigaction(signum, &foreign, ptr::null_mut()) };

        assert!(matches!(
            action.release(),
            Err(AgentError::HandlerChanged { .. })
        ));
        assert_eq!(disposition(signum), noop_info as libc::sighandler_t);

        let default = build_action(libc::SIG_DFL, &[], 0);
        unsafe { libc::sigaction(signum, &default, ptr::null_mut()) };
    }
}
