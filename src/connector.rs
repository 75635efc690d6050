//! Outbound TCP connections for a tunneling session.
//!
//! A session dials its destination at most twice: the primary destination,
//! then, if an egress fallback is configured, `(fallback, destination port)`.
//! The plan is a plain iterator of at most two [`Target`]s so the retry bound
//! is visible at the call site.

use std::{fmt, io, iter};

use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::debug;

use crate::{codec, header::Destination};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    Primary,
    Fallback,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub attempt: Attempt,
    pub authority: String,
}

#[derive(Debug, Error)]
#[error("{attempt} connection to {authority} failed")]
pub struct ConnectError {
    pub attempt: Attempt,
    pub authority: String,
    #[source]
    pub source: io::Error,
}

impl Target {
    fn error(&self, source: io::Error) -> ConnectError {
        ConnectError {
            attempt: self.attempt,
            authority: self.authority.clone(),
            source,
        }
    }
}

pub struct Connector<'a> {
    destination: &'a Destination,
    payload: &'a [u8],
    fallback: Option<&'a str>,
}

impl<'a> Connector<'a> {
    #[must_use]
    pub const fn new(
        destination: &'a Destination,
        payload: &'a [u8],
        fallback: Option<&'a str>,
    ) -> Self {
        Self {
            destination,
            payload,
            fallback,
        }
    }

    /// Primary destination first, then the fallback egress if there is one.
    pub fn plan(&self) -> impl Iterator<Item = Target> + use<'a> {
        let port = self.destination.port;
        iter::once(Target {
            attempt: Attempt::Primary,
            authority: self.destination.authority(),
        })
        .chain(self.fallback.map(|host| Target {
            attempt: Attempt::Fallback,
            authority: codec::authority(host, port),
        }))
    }

    /// Connects to `target` and writes the initial payload, if any.
    #[tracing::instrument(skip(self, target), fields(attempt = %target.attempt, authority = %target.authority))]
    pub async fn open(&self, target: &Target) -> Result<TcpStream, ConnectError> {
        debug!("Connecting to remote");
        let mut stream = TcpStream::connect(&target.authority)
            .await
            .map_err(|e| target.error(e))?;

        if !self.payload.is_empty() {
            stream
                .write_all(self.payload)
                .await
                .map_err(|e| target.error(e))?;
            debug!(bytes = self.payload.len(), "Wrote initial payload");
        }

        Ok(stream)
    }
}
