use crate::types::records::{AllocSample, FunctionCode, Record, StackSample};
use std::fmt;

/// Write `s` as a double-quoted string, escaping quotes and backslashes
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn write_function_code(f: &mut fmt::Formatter<'_>, code: &FunctionCode) -> fmt::Result {
    for range in &code.code_ranges {
        write!(f, " 0x{:016x}:0x{:x}", range.start, range.size)?;
    }
    for entry in &code.il_map {
        write!(
            f,
            " 0x{:x}:0x{:x}:0x{:x}",
            entry.il_offset, entry.native_start, entry.native_end
        )?;
    }
    Ok(())
}

impl fmt::Display for StackSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sam str {} {} {} {}:{}",
            self.thread, self.ticks, self.count, self.match_prefix, self.stack_size
        )?;
        match self.changed_ip {
            Some(0) => f.write_str(":?")?,
            Some(ip) => write!(f, ":0x{:016x}", ip)?,
            None => {}
        }
        for frame in &self.new_frames {
            write!(f, " 0x{:x}", frame.function.get())?;
            if frame.ip != 0 {
                write!(f, ":0x{:016x}", frame.ip)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for AllocSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sam mem {} {}", self.thread, self.ticks)?;
        for entry in &self.entries {
            write!(f, " 0x{:x}:{}:{}", entry.class.get(), entry.count, entry.bytes)?;
            if entry.ip != 0 {
                write!(f, ":0x{:016x}", entry.ip)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::StartTime { time } => write!(f, "prf stm {}", time),
            Record::Config { name, value } => write!(f, "prf cfg {} {}", name, value),
            Record::TracingPause { ticks } => write!(f, "prf tps {}", ticks),
            Record::TracingResume { ticks } => write!(f, "prf trs {}", ticks),
            Record::ProcessCpu { ticks, user_us } => write!(f, "prc cpu {} {}", ticks, user_us),
            Record::AppDomainCreated {
                id,
                process_id,
                status,
                name,
            } => write!(
                f,
                "apd crf 0x{:016x} 0x{:016x} 0x{:08x} {}",
                id,
                process_id,
                status,
                quote(name)
            ),
            Record::AssemblyLoaded {
                id,
                app_domain,
                module,
                status,
                name,
            } => write!(
                f,
                "asm ldf 0x{:016x} 0x{:016x} 0x{:016x} 0x{:08x} {}",
                id,
                app_domain,
                module,
                status,
                quote(name)
            ),
            Record::ModuleLoaded {
                id,
                base_address,
                assembly,
                status,
                name,
            } => write!(
                f,
                "mod ldf 0x{:016x} 0x{:016x} 0x{:016x} 0x{:08x} {}",
                id,
                base_address,
                assembly,
                status,
                quote(name)
            ),
            Record::ModuleAttached { module, assembly } => {
                write!(f, "mod ata 0x{:016x} 0x{:016x}", module, assembly)
            }
            Record::ClassLoaded {
                id,
                iid,
                module,
                token,
                status,
            } => write!(
                f,
                "cls ldf 0x{:016x} {} 0x{:016x} 0x{:08x} 0x{:08x}",
                id, iid, module, token, status
            ),
            Record::ClassName { iid, name } => write!(f, "cls nam {} {}", iid, quote(name)),
            Record::JitCompilationFinished { code, status } => {
                write!(
                    f,
                    "fun cmf 0x{:016x} {} 0x{:016x} 0x{:016x} 0x{:08x} 0x{:08x}",
                    code.id, code.iid, code.class, code.module, code.token, status
                )?;
                write_function_code(f, code)
            }
            Record::JitCachedFunctionFound { code } => {
                write!(
                    f,
                    "fun csf 0x{:016x} {} 0x{:016x} 0x{:016x} 0x{:08x}",
                    code.id, code.iid, code.class, code.module, code.token
                )?;
                write_function_code(f, code)
            }
            Record::FunctionName {
                iid,
                full_name,
                return_type,
                signature,
            } => write!(
                f,
                "fun nam {} {} {} {}",
                iid,
                quote(full_name),
                quote(return_type),
                quote(signature)
            ),
            Record::ThreadCreated { id, iid } => write!(f, "thr crt 0x{:016x} {}", id, iid),
            Record::ThreadDestroyed { iid } => write!(f, "thr dst {}", iid),
            Record::ThreadAssigned { iid, os_thread_id } => {
                write!(f, "thr aos {} {}", iid, os_thread_id)
            }
            Record::ThreadCpu {
                iid,
                ticks,
                user_us,
            } => write!(f, "thr cpu {} {} {}", iid, ticks, user_us),
            Record::StackSample(sample) => fmt::Display::fmt(sample, f),
            Record::AllocSample(sample) => fmt::Display::fmt(sample, f),
        }
    }
}
