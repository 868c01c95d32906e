//! Column printer for `dnswatch snoop`

use crate::{ExportError, ExportResult, RecordSink};
use async_trait::async_trait;
use dnswatch_core::DnsSendRecord;
use std::fmt::Write as _;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

/// Placeholder for values the record does not carry
const UNKNOWN: &str = "?";

/// A selectable output column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Time,
    Pid,
    Tgid,
    Pname,
    Port,
    Hook,
    Host,
    Cmdline,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Time,
        Field::Pid,
        Field::Tgid,
        Field::Pname,
        Field::Port,
        Field::Hook,
        Field::Host,
        Field::Cmdline,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Field::Time => "TIME",
            Field::Pid => "PID",
            Field::Tgid => "TGID",
            Field::Pname => "PNAME",
            Field::Port => "PORT",
            Field::Hook => "HOOK",
            Field::Host => "HOST",
            Field::Cmdline => "CMDLINE",
        }
    }

    /// Column width, excluding the separating space
    pub fn width(&self) -> usize {
        match self {
            Field::Time => 12,
            Field::Pid | Field::Tgid => 7,
            Field::Pname => 15,
            Field::Port => 6,
            Field::Hook => 13,
            Field::Host => 20,
            Field::Cmdline => 120,
        }
    }

    pub fn value(&self, record: &DnsSendRecord) -> String {
        match self {
            Field::Time => record.timestamp.format("%H:%M:%S%.3f").to_string(),
            Field::Pid => record.pid.to_string(),
            Field::Tgid => record.tgid.to_string(),
            Field::Pname if record.comm.is_empty() => UNKNOWN.to_string(),
            Field::Pname => record.comm.clone(),
            Field::Port => record.sock_port.to_string(),
            Field::Hook => record.hook.to_string(),
            Field::Host => record.host.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            Field::Cmdline => record
                .cmdline
                .clone()
                .unwrap_or_else(|| UNKNOWN.to_string()),
        }
    }

    /// Sorted list of accepted field names
    pub fn names() -> Vec<&'static str> {
        let mut names: Vec<_> = Field::ALL.iter().map(Field::title).collect();
        names.sort_unstable();
        names
    }
}

impl FromStr for Field {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Field::ALL
            .into_iter()
            .find(|f| f.title() == wanted)
            .ok_or_else(|| ExportError::InvalidField {
                field: s.trim().to_string(),
                valid: Field::names().join(","),
            })
    }
}

/// Parse a comma separated field list, e.g. `"pname,pid,cmdline"`
pub fn parse_fields(spec: &str) -> ExportResult<Vec<Field>> {
    spec.split(',').map(Field::from_str).collect()
}

/// Prints one fixed-width line per record
pub struct TextPrinter {
    fields: Vec<Field>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl TextPrinter {
    pub fn new(fields: Vec<Field>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            fields,
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout(fields: Vec<Field>) -> Self {
        Self::new(fields, Box::new(std::io::stdout()))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Column titles
    pub fn header(&self) -> String {
        self.line(self.fields.iter().map(|f| f.title().to_string()))
    }

    /// One record as a line, without the trailing newline
    pub fn format(&self, record: &DnsSendRecord) -> String {
        self.line(self.fields.iter().map(|f| f.value(record)))
    }

    /// Write the header line
    pub fn print_header(&self) -> ExportResult<()> {
        let header = self.header();
        let mut w = self.writer.lock().map_err(|_| ExportError::Poisoned)?;
        writeln!(w, "{}", header)?;
        Ok(())
    }

    fn line(&self, values: impl Iterator<Item = String>) -> String {
        let mut line = String::new();
        for (field, value) in self.fields.iter().zip(values) {
            let _ = write!(line, "{:<width$} ", value, width = field.width());
        }
        line.truncate(line.trim_end().len());
        line
    }
}

#[async_trait]
impl RecordSink for TextPrinter {
    fn name(&self) -> &str {
        "text"
    }

    async fn export(&self, record: &DnsSendRecord) -> ExportResult<()> {
        let line = self.format(record);
        let mut w = self.writer.lock().map_err(|_| ExportError::Poisoned)?;
        writeln!(w, "{}", line)?;
        Ok(())
    }

    async fn flush(&self) -> ExportResult<()> {
        let mut w = self.writer.lock().map_err(|_| ExportError::Poisoned)?;
        w.flush()?;
        Ok(())
    }
}

/// Call-trace line logged for every record at debug level:
/// `pid tgid port   comm   -(call)->   hook cmdline`
pub fn call_line(record: &DnsSendRecord) -> String {
    format!(
        "{:>10} {:>10} {:>10}   {}   -(call)->   {} {}",
        record.pid,
        record.tgid,
        record.sock_port,
        record.comm,
        record.hook,
        record.cmdline.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnswatch_core::config::OUTPUT_FIELDS;

    #[test]
    fn test_columns_match_config_field_names() {
        let titles: Vec<_> = Field::ALL.iter().map(Field::title).collect();
        assert_eq!(titles, OUTPUT_FIELDS);
        for name in OUTPUT_FIELDS {
            assert!(name.parse::<Field>().is_ok());
        }
    }
    use dnswatch_core::{CmdlineSource, Hook};
    use dnswatch_ebpf_common::{DnsSendEvent, FnId};
    use std::sync::Arc;

    fn record() -> DnsSendRecord {
        let mut event = DnsSendEvent::zeroed();
        event.tgid = 4242;
        event.pid = 4243;
        event.comm[..3].copy_from_slice(b"dig");
        event.sock_port_nr = 41000;
        event.fn_id = FnId::UdpSendmsg as u8;
        event.cmdline[..3].copy_from_slice(b"dig");
        event.cmdline[30..41].copy_from_slice(b"example.com");
        DnsSendRecord::from_raw(&event).unwrap()
    }

    /// Shared buffer so tests can read back what the printer wrote
    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_fields() {
        let fields = parse_fields("pname, PID,Cmdline").unwrap();
        assert_eq!(fields, vec![Field::Pname, Field::Pid, Field::Cmdline]);
    }

    #[test]
    fn test_parse_fields_rejects_unknown_and_empty() {
        let err = parse_fields("PID,QNAME").unwrap_err();
        assert!(err.to_string().contains("QNAME"));
        assert!(err.to_string().contains("CMDLINE,HOOK,HOST,PID"));
        assert!(parse_fields("PID,,TGID").is_err());
    }

    #[test]
    fn test_format_columns() {
        let printer = TextPrinter::new(
            vec![Field::Pid, Field::Tgid, Field::Pname, Field::Port, Field::Hook, Field::Cmdline],
            Box::new(std::io::sink()),
        );
        assert_eq!(
            printer.header(),
            "PID     TGID    PNAME           PORT   HOOK          CMDLINE"
        );
        assert_eq!(
            printer.format(&record()),
            "4243    4242    dig             41000  udp_sendmsg   dig example.com"
        );
    }

    #[test]
    fn test_missing_values_use_placeholder() {
        let mut record = record();
        record.cmdline = None;
        record.cmdline_source = CmdlineSource::Unknown;
        record.comm.clear();
        let printer = TextPrinter::new(vec![Field::Pname, Field::Cmdline, Field::Host], Box::new(std::io::sink()));
        let line = printer.format(&record);
        assert!(line.starts_with("?               ?"));
        assert!(line.ends_with('?'));
    }

    #[test]
    fn test_call_line() {
        let mut record = record();
        record.hook = Hook::TcpSendmsg;
        assert_eq!(
            call_line(&record),
            "      4243       4242      41000   dig   -(call)->   tcp_sendmsg dig example.com"
        );
    }

    #[tokio::test]
    async fn test_printer_sink_writes_lines() {
        let buffer = Buffer::default();
        let printer = TextPrinter::new(vec![Field::Pname, Field::Port], Box::new(buffer.clone()));
        printer.print_header().unwrap();
        printer.export(&record()).await.unwrap();
        printer.flush().await.unwrap();

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output, "PNAME           PORT\ndig             41000\n");
    }
}
