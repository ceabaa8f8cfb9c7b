//! Logging setup.
//!
//! Log destination is a url with scheme `udp`, `tcp`, or `file`, or the
//! literal `stderr`. An optional prefix is affixed to each line, which
//! syslog-style collectors use for routing.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDest {
    Stderr,
    File(PathBuf),
    Udp(String),
    Tcp(String),
}

impl LogDest {
    /// Parse a `log-dest` value.
    ///
    /// Accepts `stderr`, `file:///path`, `udp://host:port`,
    /// `tcp://host:port`. A bare `host:port` defaults to udp.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        if value.is_empty() || value == "stderr" {
            return Ok(LogDest::Stderr);
        }
        if let Some(rest) = value.strip_prefix("file://") {
            if rest.is_empty() {
                bail!("file log destination must contain a path");
            }
            return Ok(LogDest::File(PathBuf::from(rest)));
        }
        if let Some(rest) = value.strip_prefix("udp://") {
            return Ok(LogDest::Udp(rest.to_string()));
        }
        if let Some(rest) = value.strip_prefix("tcp://") {
            return Ok(LogDest::Tcp(rest.to_string()));
        }
        if value.contains("://") {
            bail!("unsupported log destination scheme in {value:?}");
        }
        Ok(LogDest::Udp(value.to_string()))
    }
}

enum Sink {
    Stderr,
    File(Mutex<std::fs::File>),
    Udp(UdpSocket),
    Tcp(Mutex<TcpStream>),
}

/// A `MakeWriter` that fans log lines to the configured destination,
/// prefixing each buffer when a prefix is set.
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<Sink>,
    prefix: Arc<str>,
}

impl LogWriter {
    fn emit(&self, buf: &[u8]) -> io::Result<usize> {
        let prefixed;
        let out: &[u8] = if self.prefix.is_empty() {
            buf
        } else {
            let mut v = Vec::with_capacity(self.prefix.len() + buf.len() + 1);
            v.extend_from_slice(self.prefix.as_bytes());
            v.push(b' ');
            v.extend_from_slice(buf);
            prefixed = v;
            &prefixed
        };
        match &*self.sink {
            Sink::Stderr => io::stderr().write_all(out)?,
            Sink::File(f) => f.lock().unwrap_or_else(|e| e.into_inner()).write_all(out)?,
            Sink::Udp(sock) => {
                sock.send(out)?;
            }
            Sink::Tcp(s) => s.lock().unwrap_or_else(|e| e.into_inner()).write_all(out)?,
        }
        Ok(buf.len())
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.emit(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Build a writer for the given destination.
pub fn writer_for(dest: &LogDest, prefix: &str) -> anyhow::Result<LogWriter> {
    let sink = match dest {
        LogDest::Stderr => Sink::Stderr,
        LogDest::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Sink::File(Mutex::new(file))
        }
        LogDest::Udp(addr) => {
            let sock = UdpSocket::bind("0.0.0.0:0").context("binding udp log socket")?;
            sock.connect(addr)
                .with_context(|| format!("connecting udp log socket to {addr}"))?;
            Sink::Udp(sock)
        }
        LogDest::Tcp(addr) => {
            let stream = TcpStream::connect(addr)
                .with_context(|| format!("connecting tcp log socket to {addr}"))?;
            Sink::Tcp(Mutex::new(stream))
        }
    };
    Ok(LogWriter {
        sink: Arc::new(sink),
        prefix: Arc::from(prefix),
    })
}

/// Install the global tracing subscriber.
///
/// `level` follows `EnvFilter` syntax; a bare level name applies globally.
/// Call once at process start.
pub fn init(level: &str, dest: &LogDest, prefix: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    let writer = writer_for(dest, prefix)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(matches!(dest, LogDest::Stderr))
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stderr_and_empty() {
        assert_eq!(LogDest::parse("stderr").unwrap(), LogDest::Stderr);
        assert_eq!(LogDest::parse("").unwrap(), LogDest::Stderr);
    }

    #[test]
    fn parses_schemes() {
        assert_eq!(
            LogDest::parse("file:///var/log/kiln.log").unwrap(),
            LogDest::File(PathBuf::from("/var/log/kiln.log"))
        );
        assert_eq!(
            LogDest::parse("udp://collector:514").unwrap(),
            LogDest::Udp("collector:514".to_string())
        );
        assert_eq!(
            LogDest::parse("tcp://collector:601").unwrap(),
            LogDest::Tcp("collector:601".to_string())
        );
    }

    #[test]
    fn bare_host_defaults_to_udp() {
        assert_eq!(
            LogDest::parse("collector:514").unwrap(),
            LogDest::Udp("collector:514".to_string())
        );
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(LogDest::parse("amqp://queue").is_err());
        assert!(LogDest::parse("file://").is_err());
    }

    #[test]
    fn file_writer_appends_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut w = writer_for(&LogDest::File(path.clone()), "kiln-node-1").unwrap();
        w.write_all(b"hello\n").unwrap();
        w.write_all(b"world\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "kiln-node-1 hello\nkiln-node-1 world\n");
    }
}
