use super::RecordError;
use crate::types::ids::InternalId;
use crate::types::records::{
    AllocEntry, AllocSample, CodeRange, FunctionCode, IlMapEntry, Record, SampleFrame,
    StackSample,
};
use std::str::FromStr;

/// Whitespace-separated token reader over one line
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            rest: line.trim_end_matches(['\r', '\n']),
        }
    }

    fn skip_spaces(&mut self) {
        self.rest = self.rest.trim_start_matches(' ');
    }

    fn next_word(&mut self) -> Option<&'a str> {
        self.skip_spaces();
        if self.rest.is_empty() {
            return None;
        }
        let end = self.rest.find(' ').unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(word)
    }

    fn word(&mut self, field: &'static str) -> Result<&'a str, RecordError> {
        self.next_word().ok_or(RecordError::MissingField(field))
    }

    fn remainder(&mut self) -> &'a str {
        self.skip_spaces();
        std::mem::take(&mut self.rest)
    }

    fn hex_usize(&mut self, field: &'static str) -> Result<usize, RecordError> {
        let word = self.word(field)?;
        parse_hex(word, field)
    }

    fn hex_u32(&mut self, field: &'static str) -> Result<u32, RecordError> {
        let word = self.word(field)?;
        parse_hex(word, field)
    }

    fn iid(&mut self, field: &'static str) -> Result<InternalId, RecordError> {
        self.hex_u32(field).map(InternalId)
    }

    fn dec<T: FromStr>(&mut self, field: &'static str) -> Result<T, RecordError> {
        let word = self.word(field)?;
        parse_dec(word, field)
    }

    fn quoted(&mut self, field: &'static str) -> Result<String, RecordError> {
        self.skip_spaces();
        let rest = self.rest;
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, '"')) => {}
            Some(_) => {
                return Err(RecordError::InvalidValue {
                    field,
                    value: rest.to_string(),
                })
            }
            None => return Err(RecordError::MissingField(field)),
        }

        let mut out = String::new();
        let mut escaped = false;
        for (pos, c) in chars {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                self.rest = &rest[pos + 1..];
                return Ok(out);
            } else {
                out.push(c);
            }
        }
        Err(RecordError::UnterminatedString)
    }

    fn finish(&mut self) -> Result<(), RecordError> {
        let rest = self.remainder();
        if rest.is_empty() {
            Ok(())
        } else {
            Err(RecordError::TrailingData(rest.to_string()))
        }
    }
}

fn parse_hex<T>(word: &str, field: &'static str) -> Result<T, RecordError>
where
    T: num_like::FromHex,
{
    let digits = word
        .strip_prefix("0x")
        .or_else(|| word.strip_prefix("0X"))
        .ok_or_else(|| RecordError::InvalidValue {
            field,
            value: word.to_string(),
        })?;
    T::from_hex(digits).ok_or_else(|| RecordError::InvalidValue {
        field,
        value: word.to_string(),
    })
}

fn parse_dec<T: FromStr>(word: &str, field: &'static str) -> Result<T, RecordError> {
    word.parse().map_err(|_| RecordError::InvalidValue {
        field,
        value: word.to_string(),
    })
}

mod num_like {
    pub trait FromHex: Sized {
        fn from_hex(digits: &str) -> Option<Self>;
    }

    macro_rules! impl_from_hex {
        ($($t:ty),*) => {
            $(impl FromHex for $t {
                fn from_hex(digits: &str) -> Option<Self> {
                    <$t>::from_str_radix(digits, 16).ok()
                }
            })*
        };
    }

    impl_from_hex!(u32, u64, usize);
}

fn parse_function_code(
    cur: &mut Cursor<'_>,
    with_status: bool,
) -> Result<(FunctionCode, u32), RecordError> {
    let mut code = FunctionCode {
        id: cur.hex_usize("function id")?,
        iid: cur.iid("function iid")?,
        class: cur.hex_usize("class id")?,
        module: cur.hex_usize("module id")?,
        token: cur.hex_u32("token")?,
        ..FunctionCode::default()
    };
    let status = if with_status {
        cur.hex_u32("status")?
    } else {
        0
    };

    while let Some(word) = cur.next_word() {
        let parts: Vec<&str> = word.split(':').collect();
        match parts.as_slice() {
            [start, size] => code.code_ranges.push(CodeRange {
                start: parse_hex(start, "code start")?,
                size: parse_hex(size, "code size")?,
            }),
            [il, start, end] => code.il_map.push(IlMapEntry {
                il_offset: parse_hex(il, "il offset")?,
                native_start: parse_hex(start, "native start")?,
                native_end: parse_hex(end, "native end")?,
            }),
            _ => {
                return Err(RecordError::InvalidValue {
                    field: "code info",
                    value: word.to_string(),
                })
            }
        }
    }
    Ok((code, status))
}

fn parse_stack_sample(cur: &mut Cursor<'_>) -> Result<StackSample, RecordError> {
    let thread = cur.iid("thread iid")?;
    let ticks = cur.dec("ticks")?;
    let count = cur.dec("count")?;

    let shape = cur.word("stack shape")?;
    let mut parts = shape.splitn(3, ':');
    let match_prefix = parse_dec(parts.next().unwrap_or_default(), "match prefix")?;
    let stack_size = parse_dec(
        parts.next().ok_or(RecordError::MissingField("stack size"))?,
        "stack size",
    )?;
    let changed_ip = match parts.next() {
        None => None,
        Some("?") => Some(0),
        Some(ip) => Some(parse_hex(ip, "changed ip")?),
    };

    let mut new_frames = Vec::new();
    while let Some(word) = cur.next_word() {
        let frame = match word.split_once(':') {
            Some((function, ip)) => SampleFrame::new(
                InternalId(parse_hex(function, "frame function")?),
                parse_hex(ip, "frame ip")?,
            ),
            None => SampleFrame::new(InternalId(parse_hex(word, "frame function")?), 0),
        };
        new_frames.push(frame);
    }

    Ok(StackSample {
        thread,
        ticks,
        count,
        match_prefix,
        stack_size,
        changed_ip,
        new_frames,
    })
}

fn parse_alloc_sample(cur: &mut Cursor<'_>) -> Result<AllocSample, RecordError> {
    let thread = cur.iid("thread iid")?;
    let ticks = cur.dec("ticks")?;

    let mut entries = Vec::new();
    while let Some(word) = cur.next_word() {
        let parts: Vec<&str> = word.split(':').collect();
        let (class, count, bytes, ip) = match parts.as_slice() {
            [class, count, bytes] => (class, count, bytes, None),
            [class, count, bytes, ip] => (class, count, bytes, Some(ip)),
            _ => {
                return Err(RecordError::InvalidValue {
                    field: "allocation entry",
                    value: word.to_string(),
                })
            }
        };
        entries.push(AllocEntry {
            class: InternalId(parse_hex(class, "class iid")?),
            count: parse_dec(count, "allocation count")?,
            bytes: parse_dec(bytes, "allocation bytes")?,
            ip: match ip {
                Some(ip) => parse_hex(ip, "allocation ip")?,
                None => 0,
            },
        });
    }

    Ok(AllocSample {
        thread,
        ticks,
        entries,
    })
}

impl FromStr for Record {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut cur = Cursor::new(line);
        let group = cur.next_word().ok_or(RecordError::Empty)?;
        let action = cur.word("record action")?;

        let record = match (group, action) {
            ("prf", "stm") => {
                return Ok(Record::StartTime {
                    time: cur.remainder().to_string(),
                })
            }
            ("prf", "cfg") => {
                let name = cur.word("config name")?.to_string();
                return Ok(Record::Config {
                    name,
                    value: cur.remainder().to_string(),
                });
            }
            ("prf", "tps") => Record::TracingPause {
                ticks: cur.dec("ticks")?,
            },
            ("prf", "trs") => Record::TracingResume {
                ticks: cur.dec("ticks")?,
            },
            ("prc", "cpu") => Record::ProcessCpu {
                ticks: cur.dec("ticks")?,
                user_us: cur.dec("user time")?,
            },
            ("apd", "crf") => Record::AppDomainCreated {
                id: cur.hex_usize("app domain id")?,
                process_id: cur.hex_usize("process id")?,
                status: cur.hex_u32("status")?,
                name: cur.quoted("app domain name")?,
            },
            ("asm", "ldf") => Record::AssemblyLoaded {
                id: cur.hex_usize("assembly id")?,
                app_domain: cur.hex_usize("app domain id")?,
                module: cur.hex_usize("module id")?,
                status: cur.hex_u32("status")?,
                name: cur.quoted("assembly name")?,
            },
            ("mod", "ldf") => Record::ModuleLoaded {
                id: cur.hex_usize("module id")?,
                base_address: cur.hex_usize("base address")?,
                assembly: cur.hex_usize("assembly id")?,
                status: cur.hex_u32("status")?,
                name: cur.quoted("module name")?,
            },
            ("mod", "ata") => Record::ModuleAttached {
                module: cur.hex_usize("module id")?,
                assembly: cur.hex_usize("assembly id")?,
            },
            ("cls", "ldf") => Record::ClassLoaded {
                id: cur.hex_usize("class id")?,
                iid: cur.iid("class iid")?,
                module: cur.hex_usize("module id")?,
                token: cur.hex_u32("token")?,
                status: cur.hex_u32("status")?,
            },
            ("cls", "nam") => Record::ClassName {
                iid: cur.iid("class iid")?,
                name: cur.quoted("class name")?,
            },
            ("fun", "cmf") => {
                let (code, status) = parse_function_code(&mut cur, true)?;
                Record::JitCompilationFinished { code, status }
            }
            ("fun", "csf") => {
                let (code, _) = parse_function_code(&mut cur, false)?;
                Record::JitCachedFunctionFound { code }
            }
            ("fun", "nam") => Record::FunctionName {
                iid: cur.iid("function iid")?,
                full_name: cur.quoted("function name")?,
                return_type: cur.quoted("return type")?,
                signature: cur.quoted("signature")?,
            },
            ("thr", "crt") => Record::ThreadCreated {
                id: cur.hex_usize("thread id")?,
                iid: cur.iid("thread iid")?,
            },
            ("thr", "dst") => Record::ThreadDestroyed {
                iid: cur.iid("thread iid")?,
            },
            ("thr", "aos") => Record::ThreadAssigned {
                iid: cur.iid("thread iid")?,
                os_thread_id: cur.dec("os thread id")?,
            },
            ("thr", "cpu") => Record::ThreadCpu {
                iid: cur.iid("thread iid")?,
                ticks: cur.dec("ticks")?,
                user_us: cur.dec("user time")?,
            },
            ("sam", "str") => Record::StackSample(parse_stack_sample(&mut cur)?),
            ("sam", "mem") => Record::AllocSample(parse_alloc_sample(&mut cur)?),
            (group, action) => {
                return Err(RecordError::UnknownTag(
                    group.to_string(),
                    action.to_string(),
                ))
            }
        };

        cur.finish()?;
        Ok(record)
    }
}
