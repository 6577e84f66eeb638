// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use qp_runtime::runtime::fault::FaultFlag;

use std::convert::From;

pub type Result<T> = std::result::Result<T, Error>;

/// Fault code raised by a lane when a checked addition overflows.
pub(crate) const FAULT_INTEGER_OVERFLOW: u32 = 1;

/// Fault code raised by a lane when a digit function returns a value outside
/// of its fanout.
pub(crate) const FAULT_DIGIT_OUT_OF_RANGE: u32 = 2;

/// Fault code raised by a lane when an on-chip structure is full.
pub(crate) const FAULT_CAPACITY_EXCEEDED: u32 = 3;

#[derive(Debug)]
pub enum ErrorKind {
    CapacityExceeded(String),
    IntegerOverflow(String),
    InvalidArgument(String),
    OutOfBounds(String),
    RuntimeError(qp_runtime::error::Error),
    Msg(String),
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.kind {
            ErrorKind::RuntimeError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.kind, f)
    }
}

/// Converts runtime errors raised inside a kernel into operator errors.
///
/// Argument and bounds errors keep their kind, so that callers can match on
/// them regardless of whether the host or a lane detected the problem.
impl From<qp_runtime::error::Error> for Error {
    fn from(error: qp_runtime::error::Error) -> Self {
        use qp_runtime::error::ErrorKind as RtKind;

        let kind = match error.kind() {
            RtKind::InvalidArgument(msg) => Some(ErrorKind::InvalidArgument(msg.clone())),
            RtKind::IntegerOverflow(msg) => Some(ErrorKind::IntegerOverflow(msg.clone())),
            RtKind::OutOfBounds(msg) => Some(ErrorKind::OutOfBounds(msg.clone())),
            RtKind::SharedMemoryExceeded(..) => {
                Some(ErrorKind::InvalidArgument(error.to_string()))
            }
            _ => None,
        };

        match kind {
            Some(kind) => Self { kind },
            None => Self {
                kind: ErrorKind::RuntimeError(error),
            },
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::CapacityExceeded(ref s) => write!(f, "CapacityExceeded: {}", s),
            ErrorKind::IntegerOverflow(ref s) => write!(f, "IntegerOverflow: {}", s),
            ErrorKind::InvalidArgument(ref s) => write!(f, "InvalidArgument: {}", s),
            ErrorKind::OutOfBounds(ref s) => write!(f, "OutOfBounds: {}", s),
            ErrorKind::RuntimeError(ref e) => std::fmt::Display::fmt(e, f),
            ErrorKind::Msg(ref s) => write!(f, "Msg: {}", s),
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        ErrorKind::Msg(s)
    }
}

impl<'a> From<&'a str> for ErrorKind {
    fn from(s: &'a str) -> Self {
        ErrorKind::Msg(s.to_string())
    }
}

/// Converts a fault raised during a launch into a typed error.
pub(crate) fn check_fault(fault: &FaultFlag, operator: &str) -> Result<()> {
    match fault.check() {
        None => Ok(()),
        Some(FAULT_INTEGER_OVERFLOW) => Err(ErrorKind::IntegerOverflow(format!(
            "{}: counter or sum overflowed its integer type",
            operator
        ))
        .into()),
        Some(FAULT_DIGIT_OUT_OF_RANGE) => Err(ErrorKind::InvalidArgument(format!(
            "{}: digit function returned a value outside of its fanout",
            operator
        ))
        .into()),
        Some(FAULT_CAPACITY_EXCEEDED) => Err(ErrorKind::CapacityExceeded(format!(
            "{}: on-chip capacity exceeded",
            operator
        ))
        .into()),
        Some(code) => {
            Err(ErrorKind::Msg(format!("{}: unknown fault code {}", operator, code)).into())
        }
    }
}
