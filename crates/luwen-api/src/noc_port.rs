// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per thread NOC port selection.
//!
//! Each thread has its own selected port, starting at NOC0. [`select_noc`] changes it for
//! the lifetime of the returned guard; dropping the guard restores the previous choice.

use std::cell::Cell;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum NocId {
    #[default]
    Noc0,
    Noc1,
}

impl NocId {
    pub fn as_u8(self) -> u8 {
        match self {
            NocId::Noc0 => 0,
            NocId::Noc1 => 1,
        }
    }
}

impl From<NocId> for u8 {
    fn from(value: NocId) -> Self {
        value.as_u8()
    }
}

impl TryFrom<u8> for NocId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NocId::Noc0),
            1 => Ok(NocId::Noc1),
            other => Err(other),
        }
    }
}

thread_local! {
    static SELECTED_NOC: Cell<NocId> = const { Cell::new(NocId::Noc0) };
}

/// The port used by operations issued from this thread.
pub fn selected_noc() -> NocId {
    SELECTED_NOC.with(|noc| noc.get())
}

/// Restores the previous selection when dropped. Bound to the thread that created it.
#[must_use = "the previous NOC is restored as soon as the guard is dropped"]
pub struct NocPortGuard {
    previous: NocId,
    _not_send: PhantomData<*const ()>,
}

impl NocPortGuard {
    pub fn previous(&self) -> NocId {
        self.previous
    }
}

impl Drop for NocPortGuard {
    fn drop(&mut self) {
        SELECTED_NOC.with(|noc| noc.set(self.previous));
    }
}

pub fn select_noc(noc: NocId) -> NocPortGuard {
    let previous = SELECTED_NOC.with(|cell| cell.replace(noc));
    NocPortGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Run `f` with `noc` selected on this thread.
pub fn with_noc<T>(noc: NocId, f: impl FnOnce() -> T) -> T {
    let _guard = select_noc(noc);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_selection() {
        assert_eq!(selected_noc(), NocId::Noc0);
        {
            let outer = select_noc(NocId::Noc1);
            assert_eq!(outer.previous(), NocId::Noc0);
            assert_eq!(selected_noc(), NocId::Noc1);
            {
                let _inner = select_noc(NocId::Noc0);
                assert_eq!(selected_noc(), NocId::Noc0);
            }
            assert_eq!(selected_noc(), NocId::Noc1);
        }
        assert_eq!(selected_noc(), NocId::Noc0);
    }

    #[test]
    fn selection_is_per_thread() {
        let _guard = select_noc(NocId::Noc1);
        let other = std::thread::spawn(selected_noc).join().unwrap();
        assert_eq!(other, NocId::Noc0);
        assert_eq!(with_noc(NocId::Noc0, selected_noc), NocId::Noc0);
        assert_eq!(selected_noc(), NocId::Noc1);
    }

    #[test]
    fn noc_id_conversion() {
        assert_eq!(NocId::try_from(1), Ok(NocId::Noc1));
        assert_eq!(NocId::try_from(2), Err(2));
        assert_eq!(u8::from(NocId::Noc1), 1);
    }
}
