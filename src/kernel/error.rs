//! Result codes and per-operation error types.
//!
//! Following POSIX, a fallible kernel service reports its outcome as a
//! numeric code: `0` on success, an `<errno.h>`-style positive value
//! otherwise. [`ResultCode`] is the closed enumeration of every code the
//! kernel can produce. Each operation additionally gets its own small error
//! `enum` listing only the codes it can actually return; those enums share
//! their discriminants with `ResultCode` so the conversion is free.

/// Generate an error `enum` for one operation.
///
/// The variants use the same discriminants as [`ResultCode`] so that the
/// generated `From` implementations compile down to a no-op.
macro_rules! define_error {
    (
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`](crate::kernel::ResultCode) for all result codes
        /// and generic descriptions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum $name {
            $(
                $( #[$vmeta] )*
                $vname = $crate::kernel::ResultCode::$vname as u32
            ),*
        }

        impl From<Result<(), $name>> for $crate::kernel::ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    $(
                        Err($name::$vname) => Self::$vname,
                    )*
                }
            }
        }

        impl From<$name> for $crate::kernel::ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $(
                        $name::$vname => Self::$vname,
                    )*
                }
            }
        }
    };
}

/// All result codes (including success) that kernel services can return.
///
/// The numeric values align with the standard POSIX error numbers where one
/// exists, so the codes can cross a C ABI unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ResultCode {
    /// The operation completed; no errors or events occurred.
    Success = 0,
    /// The operation is not permitted in the current context. This usually
    /// means that a service requiring a thread context was invoked from an
    /// interrupt handler, or a blocking service was invoked with the
    /// scheduler locked. (`EPERM`)
    Perm = 1,
    /// The operation was interrupted before the awaited event or the timeout
    /// occurred, at user request. (`EINTR`)
    Interrupted = 4,
    /// The resource is temporarily unavailable; a `try_*` service found the
    /// object busy, full, or empty. (`EAGAIN`/`EWOULDBLOCK`)
    WouldBlock = 11,
    /// The object is in use in a way that forbids the operation. (`EBUSY`)
    Busy = 16,
    /// An argument is invalid in a way not covered by any other code.
    /// (`EINVAL`)
    Inval = 22,
    /// Completing the operation would deadlock the calling thread.
    /// (`EDEADLK`)
    Deadlock = 35,
    /// A corrupted message was detected. (`EBADMSG`)
    BadMsg = 74,
    /// A counter would exceed its maximum value. (`EOVERFLOW`)
    Overflow = 75,
    /// A message is larger than the queue's message size. (`EMSGSIZE`)
    MsgSize = 90,
    /// The time limit associated with the operation expired before the
    /// operation completed. (`ETIMEDOUT`)
    TimedOut = 110,
    /// The owner of a robust mutex terminated while holding the mutex lock;
    /// the caller acquired the mutex and must restore its invariants.
    /// (`EOWNERDEAD`)
    OwnerDead = 130,
    /// The state protected by a robust mutex was abandoned without being
    /// marked consistent and can no longer be recovered. (`ENOTRECOVERABLE`)
    NotRecoverable = 131,
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    #[inline]
    pub fn is_err(self) -> bool {
        self != Self::Success
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

define_error! {
    /// Error type for services that can only fail by being invoked in the
    /// wrong context.
    pub enum PermError {
        Perm,
    }
}

define_error! {
    /// The reason a waiting thread was woken before its wait condition was
    /// satisfied. Stored in the thread's wait state by the wake-upper and
    /// translated into an operation-specific error by the blocked service.
    pub enum WaitError {
        /// The wait was interrupted by a signal, an explicit wake-up, or a
        /// deferred cancellation request.
        Interrupted,
        /// The deadline registered with the tick engine passed.
        TimedOut,
        /// The previous owner of the awaited robust mutex terminated while
        /// holding the lock. The woken thread received the ownership.
        OwnerDead,
        /// The awaited robust mutex entered the unrecoverable state.
        NotRecoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_alignment() {
        // The wire values are part of the public contract.
        assert_eq!(ResultCode::Success as u32, 0);
        assert_eq!(ResultCode::Perm as u32, 1);
        assert_eq!(ResultCode::Interrupted as u32, 4);
        assert_eq!(ResultCode::WouldBlock as u32, 11);
        assert_eq!(ResultCode::Busy as u32, 16);
        assert_eq!(ResultCode::Inval as u32, 22);
        assert_eq!(ResultCode::Deadlock as u32, 35);
        assert_eq!(ResultCode::BadMsg as u32, 74);
        assert_eq!(ResultCode::Overflow as u32, 75);
        assert_eq!(ResultCode::MsgSize as u32, 90);
        assert_eq!(ResultCode::TimedOut as u32, 110);
        assert_eq!(ResultCode::OwnerDead as u32, 130);
        assert_eq!(ResultCode::NotRecoverable as u32, 131);
    }

    #[test]
    fn wait_error_conversion() {
        assert_eq!(
            ResultCode::from(WaitError::TimedOut),
            ResultCode::TimedOut
        );
        assert_eq!(
            ResultCode::from(Err::<(), _>(WaitError::Interrupted)),
            ResultCode::Interrupted
        );
        assert_eq!(ResultCode::from(Ok::<(), WaitError>(())), ResultCode::Success);
        assert!(ResultCode::from(WaitError::OwnerDead).is_err());
        assert!(ResultCode::Success.is_ok());
    }
}
