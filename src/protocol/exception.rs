//! Structured server exceptions

use tokio::io::AsyncRead;

use super::codec::{Reader, Writer};
use crate::error::{Error, Result};

/// Default bound on the length of a caused-by chain
pub const DEFAULT_MAX_EXCEPTION_DEPTH: usize = 64;

/// Error reported by the server, optionally caused by a nested exception
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub nested: Option<Box<Exception>>,
}

impl Exception {
    pub fn new(code: i32, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            message: message.into(),
            stack_trace: String::new(),
            nested: None,
        }
    }

    pub fn with_nested(mut self, nested: Exception) -> Self {
        self.nested = Some(Box::new(nested));
        self
    }

    /// Number of exceptions in the chain, this one included.
    pub fn depth(&self) -> usize {
        self.chain().count()
    }

    /// This exception followed by its causes, innermost last.
    pub fn chain(&self) -> impl Iterator<Item = &Exception> {
        std::iter::successors(Some(self), |exc| exc.nested.as_deref())
    }

    /// Encode in server wire order.
    pub fn write_to(&self, wr: &mut Writer) {
        for exc in self.chain() {
            wr.i32(exc.code);
            wr.string(&exc.name);
            wr.string(&exc.message);
            wr.string(&exc.stack_trace);
            wr.bool(exc.nested.is_some());
        }
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Exception {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.nested
            .as_deref()
            .map(|exc| exc as &(dyn std::error::Error + 'static))
    }
}

fn trim_message(name: &str, message: &str) -> String {
    message
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(message)
        .trim()
        .to_string()
}

/// Decode an exception and its causes.
///
/// Decoding is iterative; chains longer than `max_depth` fail with
/// [`Error::ExceptionTooDeep`].
pub async fn read_exception<R>(rd: &mut Reader<R>, max_depth: usize) -> Result<Exception>
where
    R: AsyncRead + Unpin,
{
    let mut chain: Vec<Exception> = Vec::new();
    loop {
        if chain.len() >= max_depth {
            return Err(Error::ExceptionTooDeep(max_depth));
        }

        let code = rd.i32().await?;
        let name = rd.string().await?;
        let message = rd.string().await?;
        let stack_trace = rd.string().await?;
        let has_nested = rd.bool().await?;

        chain.push(Exception {
            code,
            message: trim_message(&name, &message),
            name,
            stack_trace,
            nested: None,
        });

        if !has_nested {
            break;
        }
    }

    let mut exc = chain
        .pop()
        .ok_or_else(|| Error::Protocol("empty exception chain".to_string()))?;
    while let Some(mut outer) = chain.pop() {
        outer.nested = Some(Box::new(exc));
        exc = outer;
    }
    Ok(exc)
}
