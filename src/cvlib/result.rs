use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
};
use tracing::{error, warn};

/// Coarse classification of what went wrong. Only [`ErrorKind::InvalidKey`] ever reaches the
/// caller of a load request, everything else is resolved inside the load task.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub enum ErrorKind {
    InvalidKey,
    MalformedUrl,
    Io,
    Decode,
    Config,
    #[default]
    Other,
}

/// The error type of cvimage. It carries a message and an [`ErrorKind`] such that callers can
/// tell a rejected key from a failed transport without parsing messages.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct CvError {
    kind: ErrorKind,
    msg: String,
}
impl CvError {
    pub fn new(msg: &str) -> CvError {
        CvError {
            kind: ErrorKind::Other,
            msg: msg.to_string(),
        }
    }
    pub fn with_kind(kind: ErrorKind, msg: &str) -> CvError {
        CvError {
            kind,
            msg: msg.to_string(),
        }
    }
    pub fn msg(&self) -> &str {
        &self.msg
    }
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn is_invalid_key(&self) -> bool {
        self.kind == ErrorKind::InvalidKey
    }
}
impl Display for CvError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.msg)
    }
}
impl Error for CvError {}
impl From<&str> for CvError {
    fn from(value: &str) -> Self {
        CvError::new(value)
    }
}
/// cvimage's result type with [`CvError`](CvError) as error type.
pub type CvResult<U> = Result<U, CvError>;

pub fn trace_ok_err<T, E>(x: Result<T, E>) -> Option<T>
where
    E: Debug,
{
    match x {
        Ok(x) => Some(x),
        Err(e) => {
            error!("{e:?}");
            None
        }
    }
}
pub fn trace_ok_warn<T, E>(x: Result<T, E>) -> Option<T>
where
    E: Debug,
{
    match x {
        Ok(x) => Some(x),
        Err(e) => {
            warn!("{e:?}");
            None
        }
    }
}
/// Creates a [`CvError`](CvError) with a formatted message. Optionally, the first argument is an
/// [`ErrorKind`](ErrorKind) followed by a semicolon.
/// ```rust
/// # use std::error::Error;
/// use cvlib::{cverr, result::{CvError, ErrorKind}};
/// # fn main() -> Result<(), Box<dyn Error>> {
/// assert_eq!(cverr!("some error {}", 1), CvError::new(format!("some error {}", 1).as_str()));
/// assert_eq!(cverr!(ErrorKind::Io; "gone").kind(), ErrorKind::Io);
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! cverr {
    ($s:literal) => {
        $crate::result::CvError::new(format!($s).as_str())
    };
    ($s:literal, $( $exps:expr ),*) => {
        $crate::result::CvError::new(format!($s, $($exps,)*).as_str())
    };
    ($kind:expr; $s:literal) => {
        $crate::result::CvError::with_kind($kind, format!($s).as_str())
    };
    ($kind:expr; $s:literal, $( $exps:expr ),*) => {
        $crate::result::CvError::with_kind($kind, format!($s, $($exps,)*).as_str())
    }
}

pub fn to_cv<E: Debug>(e: E) -> CvError {
    cverr!(
        "original error type is '{:?}', error message is '{:?}'",
        std::any::type_name::<E>(),
        e
    )
}

/// Like [`to_cv`](to_cv) but keeps the given kind.
pub fn to_cv_kind<E: Debug>(kind: ErrorKind) -> impl Fn(E) -> CvError {
    move |e| {
        cverr!(
            kind; "original error type is '{:?}', error message is '{:?}'",
            std::any::type_name::<E>(),
            e
        )
    }
}

#[test]
fn test_kinds() {
    let e = cverr!(ErrorKind::InvalidKey; "empty key");
    assert!(e.is_invalid_key());
    assert_eq!(e.msg(), "empty key");
    let e = to_cv_kind(ErrorKind::Io)("broken pipe");
    assert_eq!(e.kind(), ErrorKind::Io);
    assert!(e.msg().contains("broken pipe"));
    assert_eq!(to_cv(3).kind(), ErrorKind::Other);
    assert_eq!(format!("{}", CvError::new("x")), "Other: x");
}
