//! Errors raised while reconstructing state from a memory image.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),

    #[error("type `{0}` not found")]
    TypeNotFound(String),

    #[error("`{ty}` has no member `{member}`")]
    MissingMember { ty: String, member: String },

    #[error("memory at {0:#x} is not present in the image")]
    MemoryUnavailable(u64),

    #[error("unsupported read width of {0} bytes")]
    InvalidWidth(u64),

    #[error("`{ty}` matches no known layout")]
    LayoutMismatch { ty: String },

    #[error("no architecture registered as `{0}`")]
    UnknownArchitecture(String),

    #[error("`{0}` is already registered")]
    DuplicateRegistration(String),

    #[error("register `{0}` is undefined")]
    UndefinedRegister(String),

    #[error("{0}")]
    Dwarf(gimli::Error),
}

impl From<gimli::Error> for Error {
    fn from(err: gimli::Error) -> Self {
        Error::Dwarf(err)
    }
}

impl Error {
    /// Returns true for failures to resolve a symbol, type or member by name.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Error::SymbolNotFound(_) | Error::TypeNotFound(_) | Error::MissingMember { .. }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dwarf_errors_convert() {
        fn fail() -> Result<()> {
            Err::<(), _>(gimli::Error::NoUnwindInfoForAddress)?;
            Ok(())
        }

        let err = fail().unwrap_err();
        assert!(matches!(err, Error::Dwarf(gimli::Error::NoUnwindInfoForAddress)));
        assert_eq!(err.to_string(), gimli::Error::NoUnwindInfoForAddress.to_string());
        assert!(!err.is_resolution());
    }
}
