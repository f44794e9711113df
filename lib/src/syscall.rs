//! Line and argument grammar for the trace log.
//!
//! The tracer writes one completed system call per line in the form
//! `name(args) = retval [ERRNO message]`, annotating file descriptors inline
//! as `N<path>`. This module classifies raw lines into [`TraceEvent`]s and
//! provides the argument scanners the parser dispatches on; it knows nothing
//! about what any call means.

use std::{net::IpAddr, path::PathBuf};

use color_eyre::{
    eyre::{bail, ensure, eyre, Context},
    Result, Section, SectionExt,
};
use serde::Serialize;

/// One line of the trace, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A completed system call.
    Syscall(SyscallLine),

    /// An asynchronous signal delivery.
    Signal(SignalLine),

    /// Structural markers carrying no filesystem information: process-exit
    /// lines, `<unfinished ...>`/`<detached ...>` fragments, and the
    /// `????(` lines the tracer emits for calls it lost track of.
    Skip,
}

/// A completed system call, split into its parts but not yet interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct SyscallLine {
    /// The system call name.
    pub name: String,

    /// Raw argument text between the outermost parentheses.
    pub args: String,

    /// Return value. `None` for calls that do not return
    /// (`_exit`, `exit_group`).
    pub ret: Option<i64>,

    /// Path annotation on a returned file descriptor (`3</etc/passwd>`).
    pub ret_path: Option<PathBuf>,

    /// Errno symbol when the call failed (e.g. `ENOENT`).
    pub err: Option<String>,
}

impl SyscallLine {
    /// Whether the call completed successfully.
    pub fn ok(&self) -> bool {
        self.err.is_none()
    }

    /// Whether the call failed with the given errno symbol.
    pub fn failed_with(&self, errno: &str) -> bool {
        self.err.as_deref() == Some(errno)
    }
}

/// A decoded signal line.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalLine {
    /// Signal symbol, e.g. `SIGCHLD`. Taken from `si_signo` when the line
    /// carries a decoded siginfo record.
    pub signal: String,

    /// The `si_code` symbol, when present.
    pub code: Option<String>,

    /// Pid of the sending process, when the siginfo record carries one.
    pub sender: Option<i64>,
}

/// Classify a raw trace line.
///
/// Signal lines begin with `---` and exit markers with `+++`; detached,
/// unfinished, and malformed `????(` lines are skipped. Everything else must
/// parse as a completed syscall or the line is a structural error.
pub fn classify(line: &str) -> Result<TraceEvent> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with("+++") {
        return Ok(TraceEvent::Skip);
    }
    if line.starts_with("---") {
        return parse_signal(line).map(TraceEvent::Signal);
    }
    if line.ends_with("<detached ...>")
        || line.contains("<unfinished ...>")
        || line.starts_with("????(")
    {
        return Ok(TraceEvent::Skip);
    }
    parse_syscall(line).map(TraceEvent::Syscall)
}

fn parse_syscall(line: &str) -> Result<SyscallLine> {
    let (name, rest) = line
        .split_once('(')
        .ok_or_else(|| eyre!("syscall line without opening parenthesis"))
        .with_section(|| line.to_string().header("Line:"))?;

    // Exit-class calls do not return; there is no `=` to split on.
    if name == "_exit" || name == "exit_group" {
        let args = rest.split_once(')').map(|(args, _)| args).unwrap_or(rest);
        return Ok(SyscallLine {
            name: name.to_string(),
            args: args.to_string(),
            ret: None,
            ret_path: None,
            err: None,
        });
    }

    let (args, retstr) = rest
        .rsplit_once('=')
        .ok_or_else(|| eyre!("syscall line without return value"))
        .with_section(|| line.to_string().header("Line:"))?;
    let args = args
        .trim_end()
        .strip_suffix(')')
        .ok_or_else(|| eyre!("syscall arguments not closed"))
        .with_section(|| line.to_string().header("Line:"))?;

    let retstr = retstr.trim_start();
    let (ret, ret_path, tail) = if let Some(tail) = retstr.strip_prefix('?') {
        // The call was interrupted before returning; treat it as failed.
        (-1, None, tail)
    } else {
        let (ret, tail) = scan_int(retstr)
            .context("scan return value")
            .with_section(|| line.to_string().header("Line:"))?;
        match tail.strip_prefix('<') {
            Some(annotated) => {
                let close = annotated
                    .find('>')
                    .ok_or_else(|| eyre!("unterminated descriptor annotation"))?;
                let path = PathBuf::from(&annotated[..close]);
                (ret, Some(path), &annotated[close + 1..])
            }
            None => (ret, None, tail),
        }
    };

    // Failures carry the errno symbol right after the return value; successes
    // sometimes carry decoded annotations in parentheses, which are not errors.
    let err = tail
        .split_whitespace()
        .next()
        .filter(|token| {
            token.starts_with('E')
                && token
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        })
        .map(str::to_string);

    Ok(SyscallLine {
        name: name.to_string(),
        args: args.to_string(),
        ret: Some(ret),
        ret_path,
        err,
    })
}

/// Scan a leading integer (decimal or `0x` hex) off the front of `s`.
fn scan_int(s: &str) -> Result<(i64, &str)> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let end = hex
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(hex.len());
        ensure!(end > 0, "expected hex digits");
        let value = i64::from_str_radix(&hex[..end], 16).context("parse hex value")?;
        Ok((value, &hex[end..]))
    } else {
        let sign = usize::from(s.starts_with('-'));
        let end = s[sign..]
            .find(|c: char| !c.is_ascii_digit())
            .map(|i| i + sign)
            .unwrap_or(s.len());
        ensure!(end > sign, "expected digits");
        let value = s[..end].parse::<i64>().context("parse value")?;
        Ok((value, &s[end..]))
    }
}

fn parse_signal(line: &str) -> Result<SignalLine> {
    let body = line.trim_matches('-').trim();
    let (signal, rest) = body.split_once(' ').unwrap_or((body, ""));

    let mut signo = None;
    let mut code = None;
    let mut sender = None;
    let rest = rest.trim();
    if let Some(record) = rest.strip_prefix('{') {
        let record = record.split('}').next().unwrap_or(record);
        for item in record.split(", ") {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            match key {
                "si_signo" => signo = Some(value.to_string()),
                "si_code" => code = Some(value.to_string()),
                "si_pid" => sender = value.parse::<i64>().ok(),
                _ => {}
            }
        }
    }

    // Only siginfo records with a sender pid are trusted to name the signal;
    // otherwise the leading symbol stands.
    if sender.is_some() {
        Ok(SignalLine {
            signal: signo.unwrap_or_else(|| signal.to_string()),
            code,
            sender,
        })
    } else {
        Ok(SignalLine {
            signal: signal.to_string(),
            code: None,
            sender: None,
        })
    }
}

/// A file-descriptor argument: either the distinguished `AT_FDCWD`, or a
/// descriptor number with the path the tracer annotated on it.
#[derive(Debug, Clone, PartialEq)]
pub enum FdArg {
    /// `AT_FDCWD`: resolve relative to the calling process's working directory.
    Cwd,

    /// A numbered descriptor, annotated with its path when the tracer knew it.
    Fd { fd: i64, path: Option<PathBuf> },
}

/// Scan a double-quoted, backslash-escaped string argument.
///
/// Returns the decoded value (`None` for the distinguished `NULL`), whether
/// the argument was complete (the tracer marks truncation with a trailing
/// `...`), and the remaining argument text.
pub(crate) fn string_arg(args: &str) -> Result<(Option<String>, bool, &str)> {
    if let Some(rest) = args.strip_prefix("NULL") {
        return Ok((None, true, rest));
    }

    let rest = args
        .strip_prefix('"')
        .ok_or_else(|| eyre!("expected quoted string"))
        .with_section(|| args.to_string().header("Arguments:"))?;
    let bytes = rest.as_bytes();
    let mut value = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let end = loop {
        ensure!(i < bytes.len(), "unterminated string argument");
        match bytes[i] {
            b'"' => break i,
            b'\\' => {
                i += 1;
                ensure!(i < bytes.len(), "dangling escape in string argument");
                match bytes[i] {
                    b'n' => {
                        value.push(b'\n');
                        i += 1;
                    }
                    b't' => {
                        value.push(b'\t');
                        i += 1;
                    }
                    b'r' => {
                        value.push(b'\r');
                        i += 1;
                    }
                    b'f' => {
                        value.push(0x0c);
                        i += 1;
                    }
                    b'v' => {
                        value.push(0x0b);
                        i += 1;
                    }
                    b'a' => {
                        value.push(0x07);
                        i += 1;
                    }
                    b'b' => {
                        value.push(0x08);
                        i += 1;
                    }
                    b'0'..=b'7' => {
                        let mut octal = 0u32;
                        let mut digits = 0;
                        while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                            octal = octal * 8 + u32::from(bytes[i] - b'0');
                            i += 1;
                            digits += 1;
                        }
                        value.push(octal as u8);
                    }
                    b'x' => {
                        i += 1;
                        let mut hex = 0u32;
                        let mut digits = 0;
                        while digits < 2 && i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                            hex = hex * 16 + u32::from((bytes[i] as char).to_digit(16).unwrap_or(0));
                            i += 1;
                            digits += 1;
                        }
                        value.push(hex as u8);
                    }
                    other => {
                        value.push(other);
                        i += 1;
                    }
                }
            }
            other => {
                value.push(other);
                i += 1;
            }
        }
    };

    let rest = &rest[end + 1..];
    let value = String::from_utf8_lossy(&value).into_owned();
    match rest.strip_prefix("...") {
        Some(rest) => Ok((Some(value), false, rest)),
        None => Ok((Some(value), true, rest)),
    }
}

/// Position at the beginning of the next argument.
pub(crate) fn next_arg(args: &str) -> &str {
    args.strip_prefix(',').unwrap_or(args).trim_start()
}

/// Scan a `|`-separated symbolic flag set. Flags are printed without
/// whitespace, so the set ends at the next comma.
pub(crate) fn flags_arg(args: &str) -> (Vec<&str>, &str) {
    let (flags, rest) = args.split_once(',').unwrap_or((args, ""));
    (flags.trim().split('|').collect(), rest)
}

/// Scan a file-descriptor argument, which may be `AT_FDCWD` or a descriptor
/// number annotated with its path (`3</var/log>`).
pub(crate) fn fd_arg(args: &str) -> Result<(FdArg, &str)> {
    if let Some(rest) = args.strip_prefix("AT_FDCWD") {
        return Ok((FdArg::Cwd, rest));
    }

    let end = args
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(args.len());
    ensure!(end > 0, "expected file descriptor argument");
    let fd = args[..end].parse::<i64>().context("parse file descriptor")?;

    let rest = &args[end..];
    match rest.strip_prefix('<') {
        Some(annotated) => {
            let close = annotated
                .find('>')
                .ok_or_else(|| eyre!("unterminated descriptor annotation"))?;
            let path = PathBuf::from(&annotated[..close]);
            Ok((FdArg::Fd { fd, path: Some(path) }, &annotated[close + 1..]))
        }
        None => Ok((FdArg::Fd { fd, path: None }, rest)),
    }
}

/// A socket address decoded from a brace-delimited `sa_family` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "family")]
pub enum SockAddr {
    /// A unix-domain socket. Abstract names are printed by the tracer with a
    /// leading `@`.
    Local {
        path: String,
        #[serde(rename = "abstract")]
        r#abstract: bool,
    },

    /// An IPv4 endpoint.
    Inet { addr: String, port: u16 },

    /// An IPv6 endpoint.
    Inet6 { addr: String, port: u16 },

    /// A kernel netlink socket; carries no endpoint we care about.
    Netlink,

    /// `AF_UNSPEC`, used to dissolve a connected association.
    Unspec,
}

impl std::fmt::Display for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SockAddr::Local { path, r#abstract } => {
                let marker = if *r#abstract { "@" } else { "" };
                write!(f, "unix:{marker}{path}")
            }
            SockAddr::Inet { addr, port } => write!(f, "{addr}:{port}"),
            SockAddr::Inet6 { addr, port } => write!(f, "[{addr}]:{port}"),
            SockAddr::Netlink => write!(f, "netlink"),
            SockAddr::Unspec => write!(f, "unspec"),
        }
    }
}

impl SockAddr {
    /// Whether the address is a loopback endpoint: IPv4 `127.0.0.0/8`,
    /// IPv6 `::1`, or the IPv4-mapped form of either.
    pub fn is_loopback(&self) -> bool {
        let addr = match self {
            SockAddr::Inet { addr, .. } | SockAddr::Inet6 { addr, .. } => addr,
            _ => return false,
        };
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.octets()[0] == 127,
            Ok(IpAddr::V6(v6)) => {
                v6.is_loopback()
                    || v6
                        .to_ipv4_mapped()
                        .is_some_and(|v4| v4.octets()[0] == 127)
            }
            Err(_) => false,
        }
    }
}

/// Scan a brace-delimited socket address record. Decoding is family-specific;
/// families the tracer prints but we do not model are an error for the caller
/// to surface.
pub(crate) fn sockaddr_arg(args: &str) -> Result<(SockAddr, &str)> {
    let rest = args
        .strip_prefix('{')
        .ok_or_else(|| eyre!("expected socket address record"))
        .with_section(|| args.to_string().header("Arguments:"))?;
    let rest = rest
        .strip_prefix("sa_family=")
        .ok_or_else(|| eyre!("socket address record without sa_family"))?;
    let end = rest
        .find([',', '}'])
        .ok_or_else(|| eyre!("unterminated socket address record"))?;
    let family = &rest[..end];
    let body = rest[end..].trim_start_matches(',').trim_start();

    let (addr, body) = match family {
        "AF_NETLINK" => (SockAddr::Netlink, body),
        "AF_UNSPEC" => (SockAddr::Unspec, body),
        "AF_LOCAL" | "AF_UNIX" => {
            let body = body
                .strip_prefix("sun_path=")
                .ok_or_else(|| eyre!("unix socket address without sun_path"))?;
            let (r#abstract, body) = match body.strip_prefix('@') {
                Some(body) => (true, body),
                None => (false, body),
            };
            let (path, complete, body) = string_arg(body).context("scan sun_path")?;
            ensure!(complete, "truncated sun_path");
            let path = path.ok_or_else(|| eyre!("NULL sun_path"))?;
            (SockAddr::Local { path, r#abstract }, body)
        }
        "AF_INET" | "AF_INET6" => {
            let open = body
                .find('(')
                .ok_or_else(|| eyre!("inet socket address without port"))?;
            let close = body[open..]
                .find(')')
                .map(|i| i + open)
                .ok_or_else(|| eyre!("unterminated port in socket address"))?;
            let port = body[open + 1..close]
                .parse::<u16>()
                .context("parse socket port")?;
            let quote = body[close..]
                .find('"')
                .map(|i| i + close)
                .ok_or_else(|| eyre!("inet socket address without address"))?;
            let (addr, complete, body) = string_arg(&body[quote..]).context("scan address")?;
            ensure!(complete, "truncated socket address");
            let addr = addr.ok_or_else(|| eyre!("NULL socket address"))?;
            if family == "AF_INET" {
                (SockAddr::Inet { addr, port }, body)
            } else {
                (SockAddr::Inet6 { addr, port }, body)
            }
        }
        other => bail!("unhandled socket family: {other}"),
    };

    let (_, rest) = body
        .split_once('}')
        .ok_or_else(|| eyre!("unterminated socket address record"))?;
    Ok((addr, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test]
    fn classify_syscall() {
        let event = classify(r#"openat(AT_FDCWD, "/etc/hosts", O_RDONLY) = 3</etc/hosts>"#)
            .expect("classify line");
        let TraceEvent::Syscall(call) = event else {
            panic!("expected syscall event: {event:?}");
        };
        self::assert_eq!(call.name, "openat");
        self::assert_eq!(call.args, r#"AT_FDCWD, "/etc/hosts", O_RDONLY"#);
        self::assert_eq!(call.ret, Some(3));
        self::assert_eq!(call.ret_path, Some(PathBuf::from("/etc/hosts")));
        self::assert_eq!(call.err, None);
        assert!(call.ok());
    }

    #[test]
    fn classify_failure() {
        let event = classify(r#"stat("/nope", 0x7ffd) = -1 ENOENT (No such file or directory)"#)
            .expect("classify line");
        let TraceEvent::Syscall(call) = event else {
            panic!("expected syscall event: {event:?}");
        };
        self::assert_eq!(call.ret, Some(-1));
        self::assert_eq!(call.err.as_deref(), Some("ENOENT"));
        assert!(call.failed_with("ENOENT"));
    }

    #[test]
    fn classify_exit_group() {
        let event = classify("exit_group(0) = ?").expect("classify line");
        let TraceEvent::Syscall(call) = event else {
            panic!("expected syscall event: {event:?}");
        };
        self::assert_eq!(call.name, "exit_group");
        self::assert_eq!(call.ret, None);
    }

    #[test_case("+++ exited with 0 +++"; "exit_marker")]
    #[test_case(r#"read(3</x>, "abc" <unfinished ...>"#; "unfinished")]
    #[test_case("????( <unfinished ...>"; "lost")]
    #[test_case(""; "empty")]
    #[test]
    fn classify_skip(line: &str) {
        self::assert_eq!(TraceEvent::Skip, classify(line).expect("classify line"));
    }

    #[test]
    fn classify_sigchld() {
        let line = "--- SIGCHLD {si_signo=SIGCHLD, si_code=CLD_EXITED, si_pid=42, si_uid=0, si_status=0, si_utime=0, si_stime=0} ---";
        let event = classify(line).expect("classify line");
        let TraceEvent::Signal(signal) = event else {
            panic!("expected signal event: {event:?}");
        };
        self::assert_eq!(signal.signal, "SIGCHLD");
        self::assert_eq!(signal.code.as_deref(), Some("CLD_EXITED"));
        self::assert_eq!(signal.sender, Some(42));
    }

    #[test]
    fn classify_signal_without_sender() {
        let line = "--- SIGSEGV {si_signo=SIGSEGV, si_code=SEGV_MAPERR, si_addr=0x10} ---";
        let event = classify(line).expect("classify line");
        let TraceEvent::Signal(signal) = event else {
            panic!("expected signal event: {event:?}");
        };
        self::assert_eq!(signal.signal, "SIGSEGV");
        self::assert_eq!(signal.sender, None);
    }

    #[test_case(r#""plain", rest"#, Some("plain"), true, ", rest"; "plain")]
    #[test_case(r#"NULL, rest"#, None, true, ", rest"; "null")]
    #[test_case(r#""tab\there""#, Some("tab\there"), true, ""; "escaped_tab")]
    #[test_case(r#""quote\"inside""#, Some("quote\"inside"), true, ""; "escaped_quote")]
    #[test_case(r#""back\\slash""#, Some("back\\slash"), true, ""; "escaped_backslash")]
    #[test_case(r#""oct\101al""#, Some("octAal"), true, ""; "octal")]
    #[test_case(r#""long"..., rest"#, Some("long"), false, ", rest"; "truncated")]
    #[test]
    fn string_args(input: &str, value: Option<&str>, complete: bool, rest: &str) {
        let (actual, actual_complete, actual_rest) = string_arg(input).expect("scan string");
        self::assert_eq!(value.map(str::to_string), actual);
        self::assert_eq!(complete, actual_complete);
        self::assert_eq!(rest, actual_rest);
    }

    #[test]
    fn fd_args() {
        let (fd, rest) = fd_arg(r#"AT_FDCWD, "x""#).expect("scan fd");
        self::assert_eq!(fd, FdArg::Cwd);
        self::assert_eq!(rest, r#", "x""#);

        let (fd, rest) = fd_arg(r#"5</var/log>, "x""#).expect("scan fd");
        self::assert_eq!(
            fd,
            FdArg::Fd {
                fd: 5,
                path: Some(PathBuf::from("/var/log"))
            }
        );
        self::assert_eq!(rest, r#", "x""#);
    }

    #[test]
    fn flag_args() {
        let (flags, rest) = flags_arg("O_RDWR|O_CREAT, 0644");
        self::assert_eq!(flags, vec!["O_RDWR", "O_CREAT"]);
        self::assert_eq!(rest, " 0644");
    }

    #[test_case(
        r#"{sa_family=AF_INET, sin_port=htons(6379), sin_addr=inet_addr("127.0.0.1")}, 16"#,
        SockAddr::Inet { addr: "127.0.0.1".to_string(), port: 6379 };
        "inet"
    )]
    #[test_case(
        r#"{sa_family=AF_INET6, sin6_port=htons(0), inet_pton(AF_INET6, "::ffff:127.0.0.1", &sin6_addr), sin6_flowinfo=0, sin6_scope_id=0}, 28"#,
        SockAddr::Inet6 { addr: "::ffff:127.0.0.1".to_string(), port: 0 };
        "inet6_mapped"
    )]
    #[test_case(
        r#"{sa_family=AF_LOCAL, sun_path="/dev/log"}, 110"#,
        SockAddr::Local { path: "/dev/log".to_string(), r#abstract: false };
        "unix_path"
    )]
    #[test_case(
        r#"{sa_family=AF_LOCAL, sun_path=@"xtables"}, 110"#,
        SockAddr::Local { path: "xtables".to_string(), r#abstract: true };
        "unix_abstract"
    )]
    #[test_case(r#"{sa_family=AF_NETLINK, pid=0, groups=00000000}, 12"#, SockAddr::Netlink; "netlink")]
    #[test_case(r#"{sa_family=AF_UNSPEC}, 16"#, SockAddr::Unspec; "unspec")]
    #[test]
    fn sockaddr_args(input: &str, expected: SockAddr) {
        let (addr, rest) = sockaddr_arg(input).expect("scan sockaddr");
        self::assert_eq!(expected, addr);
        assert!(rest.starts_with(", "), "rest should be the next argument: {rest:?}");
    }

    #[test]
    fn sockaddr_unknown_family() {
        let err = sockaddr_arg("{sa_family=AF_PACKET, whatever}").expect_err("unhandled family");
        assert!(err.to_string().contains("AF_PACKET"), "{err}");
    }

    #[test_case(SockAddr::Inet { addr: "127.0.0.1".into(), port: 80 }, true; "v4_loopback")]
    #[test_case(SockAddr::Inet { addr: "127.8.1.2".into(), port: 80 }, true; "v4_loopback_subnet")]
    #[test_case(SockAddr::Inet { addr: "10.0.0.1".into(), port: 80 }, false; "v4_remote")]
    #[test_case(SockAddr::Inet6 { addr: "::1".into(), port: 80 }, true; "v6_loopback")]
    #[test_case(SockAddr::Inet6 { addr: "::ffff:127.0.0.1".into(), port: 80 }, true; "v6_mapped_loopback")]
    #[test_case(SockAddr::Inet6 { addr: "2001:db8::1".into(), port: 80 }, false; "v6_remote")]
    #[test_case(SockAddr::Local { path: "/dev/log".into(), r#abstract: false }, false; "unix")]
    #[test]
    fn loopback(addr: SockAddr, expected: bool) {
        self::assert_eq!(expected, addr.is_loopback());
    }
}
