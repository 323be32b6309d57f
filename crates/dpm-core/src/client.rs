//! Plugin-side client for the registration socket.
//!
//! A thin, synchronous call: connect, write one request line, read one
//! response line. Plugins are expected to retry on failure; nothing here
//! retries on their behalf.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::error::{ClientError, RegistrationError};
use crate::protocol::{COMMAND_REGISTER, RegisterAck, RegisterRequest, SocketRequest, SocketResponse};

/// Read/write timeout applied to the registration connection.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Register a plugin with the manager listening on `manager_socket`.
///
/// Returns the acknowledgement on success. A refusal by the manager is
/// returned as [`ClientError::Rejected`] carrying the matching
/// [`RegistrationError`] variant.
pub fn register(manager_socket: &Path, request: &RegisterRequest) -> Result<RegisterAck, ClientError> {
    let io_err = |source: std::io::Error| ClientError::Io {
        path: manager_socket.to_path_buf(),
        source,
    };

    let stream = UnixStream::connect(manager_socket).map_err(io_err)?;
    stream
        .set_read_timeout(Some(REGISTER_TIMEOUT))
        .map_err(io_err)?;
    stream
        .set_write_timeout(Some(REGISTER_TIMEOUT))
        .map_err(io_err)?;

    let envelope = SocketRequest::new(COMMAND_REGISTER, serde_json::to_value(request)?);
    let request_line = serde_json::to_string(&envelope)?;

    {
        let mut writer = BufWriter::new(&stream);
        writer.write_all(request_line.as_bytes()).map_err(io_err)?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)?;
    }

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    if reader.read_line(&mut response_line).map_err(io_err)? == 0 {
        return Err(ClientError::Protocol(
            "manager closed the connection without responding".to_string(),
        ));
    }

    let response: SocketResponse = serde_json::from_str(response_line.trim())?;
    if response.request_id != envelope.request_id {
        return Err(ClientError::Protocol(format!(
            "response for request '{}' does not match '{}'",
            response.request_id, envelope.request_id
        )));
    }

    if !response.is_ok() {
        let err = response
            .error
            .ok_or_else(|| ClientError::Protocol("error response without details".to_string()))?;
        return Err(match RegistrationError::from_code(&err.code, &err.message) {
            Some(rejection) => ClientError::Rejected(rejection),
            None => ClientError::Protocol(format!("{}: {}", err.code, err.message)),
        });
    }

    let payload = response
        .payload
        .ok_or_else(|| ClientError::Protocol("ok response without payload".to_string()))?;
    Ok(serde_json::from_value(payload)?)
}
