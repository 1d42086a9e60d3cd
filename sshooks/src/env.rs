//! `env` channel requests.
//!
//! Variables are recorded per channel and handed to the subprocess
//! started by the following `exec`; the gateway's own environment is
//! never touched.

use std::collections::BTreeMap;

use bytes::Bytes;
use log::debug;
use ssh_encoding::{Decode, Encode, Reader};

use crate::Error;

const FIELD_SEPARATOR: char = '\x0b';

/// Variables set on one channel so far.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `env` payload and record the variable.
    ///
    /// Nothing is recorded if the payload is rejected.
    pub fn apply(&mut self, payload: &[u8]) -> Result<(), Error> {
        let (name, value) = parse(payload)?;
        debug!("env {}={:?}", name, value);
        self.vars.insert(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Split an `env` payload into its name and value.
///
/// The payload is read as the SSH wire form (two length-prefixed
/// strings). Anything else goes through the textual framing some
/// clients produce: NUL bytes removed, fields separated by a vertical
/// tab, one leading control byte in front of the name.
pub fn parse(payload: &[u8]) -> Result<(String, String), Error> {
    let (name, value) = match decode_wire(payload) {
        Some(pair) => pair,
        None => split_text(payload)?,
    };
    if name.is_empty() || name.contains('=') {
        return Err(Error::InvalidEnvArguments(format!("{name}={value}")));
    }
    Ok((name, value))
}

fn decode_wire(payload: &[u8]) -> Option<(String, String)> {
    let mut reader = payload;
    let name = Vec::<u8>::decode(&mut reader).ok()?;
    let value = Vec::<u8>::decode(&mut reader).ok()?;
    if !reader.is_finished() {
        return None;
    }
    Some((String::from_utf8(name).ok()?, String::from_utf8(value).ok()?))
}

fn split_text(payload: &[u8]) -> Result<(String, String), Error> {
    let text = String::from_utf8_lossy(payload).replace('\0', "");
    let mut fields = text.split(FIELD_SEPARATOR);
    let (Some(name), Some(value), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(Error::InvalidEnvArguments(text));
    };
    let mut chars = name.chars();
    let name = match chars.next() {
        Some(c) if c.is_control() => chars.as_str(),
        _ => name,
    };
    Ok((name.to_string(), value.to_string()))
}

/// Encode a variable the way it travels in an `env` request.
pub fn encode(name: &str, value: &str) -> Result<Bytes, Error> {
    let mut buf = Vec::new();
    name.encode(&mut buf)
        .and_then(|()| value.encode(&mut buf))
        .map_err(|e| Error::InvalidEnvArguments(e.to_string()))?;
    Ok(buf.into())
}
