//! Scoped ownership of stream stages.
//!
//! A pipeline is assembled by acquiring stages through a [`ResourceGuard`].
//! Each acquired stage is pushed onto the guard's stack and released exactly
//! once, in reverse acquisition order, when the guarded scope ends. Release
//! happens on success, on error, and on unwind.
//!
//! ```no_run
//! use sealpack::resources::{with_resources, Closable};
//!
//! struct Noop;
//! impl Closable for Noop {
//!     fn close(&mut self) -> sealpack::error::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let n = with_resources(|guard| {
//!     let _a = guard.acquire("a", || Ok::<_, std::io::Error>(Noop))?;
//!     Ok(1)
//! })?;
//! # Ok::<(), sealpack::ArchiveError>(())
//! ```

use crate::error::{ArchiveError, Result};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt::Display;
use std::io::{self, Read, Write};
use std::rc::Rc;
use tracing::{debug, warn};

/// Capability shared by every stage the guard can own.
pub trait Closable {
    /// Release the underlying resource. Called at most once by the guard.
    fn close(&mut self) -> Result<()>;
}

/// Shared handle to an acquired stage.
///
/// The guard keeps a type-erased clone for teardown, while downstream stages
/// hold typed clones as their data source or sink.
pub struct StageHandle<T>(Rc<RefCell<T>>);

impl<T> StageHandle<T> {
    pub fn new(stage: T) -> Self {
        Self(Rc::new(RefCell::new(stage)))
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }
}

impl<T> Clone for StageHandle<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: Read> Read for StageHandle<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl<T: Write> Write for StageHandle<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

struct Held {
    label: &'static str,
    stage: Rc<RefCell<dyn Closable>>,
}

/// Ordered stack of acquired stages.
#[derive(Default)]
pub struct ResourceGuard {
    held: Vec<Held>,
}

impl ResourceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a stage with `factory` and take ownership of it.
    ///
    /// A factory that produces nothing fails the acquisition with
    /// [`ArchiveError::Acquisition`]; stages acquired earlier stay on the
    /// stack and are released when the guard is.
    pub fn acquire<T, E, F>(&mut self, label: &'static str, factory: F) -> Result<StageHandle<T>>
    where
        T: Closable + 'static,
        E: Display,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let stage = factory().map_err(|e| {
            debug!(stage = label, error = %e, "stage acquisition failed");
            ArchiveError::acquisition(format!("{}: {}", label, e))
        })?;

        let handle = StageHandle::new(stage);
        let erased: Rc<RefCell<dyn Closable>> = handle.0.clone();
        self.held.push(Held {
            label,
            stage: erased,
        });
        debug!(stage = label, depth = self.held.len(), "stage acquired");
        Ok(handle)
    }

    /// Number of stages currently held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release every held stage, newest first. Failures are logged and dropped.
    pub fn release(&mut self) {
        while let Some(Held { label, stage }) = self.held.pop() {
            let outcome = match stage.try_borrow_mut() {
                Ok(mut s) => s.close(),
                Err(_) => Err(ArchiveError::io("stage still borrowed at release")),
            };
            match outcome {
                Ok(()) => debug!(stage = label, "stage released"),
                Err(e) => warn!(stage = label, error = %e, "stage release failed"),
            }
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run `body` with a fresh guard and release everything it acquired.
///
/// Returns the body's own result; release errors never replace it.
pub fn with_resources<T, F>(body: F) -> Result<T>
where
    F: FnOnce(&mut ResourceGuard) -> Result<T>,
{
    let mut guard = ResourceGuard::new();
    let result = body(&mut guard);
    guard.release();
    result
}
