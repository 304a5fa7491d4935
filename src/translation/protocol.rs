use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL_VERSION: u8 = 3;

/// Packet command codes of the translation protocol. Every packet on the
/// wire is `[u16 length][u16 command][payload]`, least-significant byte
/// first; strings are UTF-8 without a terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TranslationCommand {
    Begin = 1,
    End = 2,

    // request features
    Uri = 10,
    Host = 11,
    Session = 12,
    Realm = 13,
    Check = 14,
    Auth = 15,
    WantFullUri = 16,
    WidgetType = 17,
    Param = 18,

    // response: address variants
    Path = 30,
    Http = 31,
    Address = 32,
    Lhttp = 33,
    Cgi = 34,
    FastCgi = 35,
    Was = 36,
    Pipe = 37,
    NfsServer = 38,
    NfsExport = 39,
    NfsPath = 40,
    Append = 41,
    PathInfo = 42,
    QueryString = 43,
    ScriptName = 44,
    DocumentRoot = 45,
    Action = 46,
    Interpreter = 47,
    Concurrency = 48,

    // response: caching / matching
    Base = 60,
    EasyBase = 61,
    Regex = 62,
    InverseRegex = 63,
    UnsafeBase = 64,
    ExpandPath = 65,
    MaxAge = 66,
    Vary = 67,
    Invalidate = 68,
    CacheTag = 69,
    AutoFlushCache = 70,

    // response: presentation
    Status = 80,
    Redirect = 81,
    TestPath = 82,
    Process = 83,
    Container = 84,
    ProcessCss = 85,
    ProcessText = 86,
    View = 87,
    RequestHeaderForward = 88,
    ResponseHeaderForward = 89,
    PrefixCssClass = 90,
    PrefixXmlId = 91,
    FocusWidget = 92,
    Stateful = 93,
}

impl TranslationCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        use TranslationCommand::*;
        Some(match v {
            1 => Begin,
            2 => End,
            10 => Uri,
            11 => Host,
            12 => Session,
            13 => Realm,
            14 => Check,
            15 => Auth,
            16 => WantFullUri,
            17 => WidgetType,
            18 => Param,
            30 => Path,
            31 => Http,
            32 => Address,
            33 => Lhttp,
            34 => Cgi,
            35 => FastCgi,
            36 => Was,
            37 => Pipe,
            38 => NfsServer,
            39 => NfsExport,
            40 => NfsPath,
            41 => Append,
            42 => PathInfo,
            43 => QueryString,
            44 => ScriptName,
            45 => DocumentRoot,
            46 => Action,
            47 => Interpreter,
            48 => Concurrency,
            60 => Base,
            61 => EasyBase,
            62 => Regex,
            63 => InverseRegex,
            64 => UnsafeBase,
            65 => ExpandPath,
            66 => MaxAge,
            67 => Vary,
            68 => Invalidate,
            69 => CacheTag,
            70 => AutoFlushCache,
            80 => Status,
            81 => Redirect,
            82 => TestPath,
            83 => Process,
            84 => Container,
            85 => ProcessCss,
            86 => ProcessText,
            87 => View,
            88 => RequestHeaderForward,
            89 => ResponseHeaderForward,
            90 => PrefixCssClass,
            91 => PrefixXmlId,
            92 => FocusWidget,
            93 => Stateful,
            _ => return None,
        })
    }
}

/// Append one packet.
pub fn write_packet(out: &mut BytesMut, command: TranslationCommand, payload: &[u8]) {
    debug_assert!(payload.len() <= u16::MAX as usize);
    out.put_u16_le(payload.len() as u16);
    out.put_u16_le(command as u16);
    out.put_slice(payload);
}

pub fn write_string(out: &mut BytesMut, command: TranslationCommand, payload: &str) {
    write_packet(out, command, payload.as_bytes());
}

/// One decoded packet.
#[derive(Debug)]
pub struct Packet {
    pub command: TranslationCommand,
    pub payload: Bytes,
}

/// Split packets off the front of `buf`. Unknown commands are skipped.
pub fn read_packet(buf: &mut BytesMut) -> Result<Option<Packet>, &'static str> {
    loop {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 4 + length {
            return Ok(None);
        }
        let raw_command = u16::from_le_bytes([buf[2], buf[3]]);
        buf.advance(4);
        let payload = buf.split_to(length).freeze();
        match TranslationCommand::from_u16(raw_command) {
            Some(command) => return Ok(Some(Packet { command, payload })),
            None => {
                // tolerate unknown commands from newer servers
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let mut buf = BytesMut::new();
        write_packet(&mut buf, TranslationCommand::Begin, &[PROTOCOL_VERSION]);
        write_string(&mut buf, TranslationCommand::Uri, "/index.html");
        write_packet(&mut buf, TranslationCommand::End, b"");

        let p = read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(p.command, TranslationCommand::Begin);
        assert_eq!(&p.payload[..], &[PROTOCOL_VERSION]);

        let p = read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(p.command, TranslationCommand::Uri);
        assert_eq!(&p.payload[..], b"/index.html");

        let p = read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(p.command, TranslationCommand::End);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_packet_waits() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, TranslationCommand::Host, "example.com");
        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..5]);
        assert!(read_packet(&mut partial).unwrap().is_none());
    }

    #[test]
    fn unknown_commands_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(2);
        buf.put_u16_le(9999);
        buf.put_slice(b"xx");
        write_string(&mut buf, TranslationCommand::Host, "h");
        let p = read_packet(&mut buf).unwrap().unwrap();
        assert_eq!(p.command, TranslationCommand::Host);
    }
}
