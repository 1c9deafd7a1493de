//! メモリアクセス機能
//!
//! `/proc/<pid>/mem` を優先し、使用できない場合は PTRACE_PEEKDATA / PTRACE_POKEDATA に
//! フォールバックします。読み取り・書き込みはどちらも部分的に成功し得ます。

use crate::{ModuleInfo, Result, TargetError};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read as _, Seek, SeekFrom, Write as _};

const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピング元ファイル内のオフセット
    pub offset: u64,
    /// マッピング元（ファイルパスや `[stack]` など）
    pub pathname: Option<String>,
}

impl MemoryMapping {
    /// /proc/pid/maps の1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let (start, end) = parts.next()?.split_once('-')?;
        let perms = parts.next()?.as_bytes();
        let offset = parts.next()?;
        let _dev = parts.next()?;
        let _inode = parts.next()?;
        // パス名は空白を含む場合がある
        let pathname = parts.collect::<Vec<_>>().join(" ");

        Some(Self {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset: u64::from_str_radix(offset, 16).ok()?,
            pathname: (!pathname.is_empty()).then_some(pathname),
        })
    }

    /// ファイルに対応するマッピングか（`[heap]` などの疑似マッピングを除く）
    pub fn is_file_backed(&self) -> bool {
        self.pathname
            .as_deref()
            .is_some_and(|p| p.starts_with('/'))
    }
}

/// マッピング一覧をファイル単位のモジュール一覧にまとめる
///
/// モジュールの範囲は同じファイルに対応する全マッピングの最小開始〜最大終了です。
/// 出現順（最初のマッピングのアドレス順）を保ちます。
pub fn modules_from_mappings(mappings: &[MemoryMapping]) -> Vec<ModuleInfo> {
    let mut modules: Vec<ModuleInfo> = Vec::new();
    for mapping in mappings.iter().filter(|m| m.is_file_backed()) {
        let Some(name) = mapping.pathname.as_deref() else {
            continue;
        };
        match modules.iter_mut().find(|m| m.name == name) {
            Some(module) => {
                module.base = module.base.min(mapping.start);
                module.end = module.end.max(mapping.end);
            }
            None => modules.push(ModuleInfo {
                name: name.to_string(),
                base: mapping.start,
                end: mapping.end,
            }),
        }
    }
    modules
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// 読み取れた分だけを返します。/proc/pid/mem で1バイトも読めなかった場合は
    /// PTRACE_PEEKDATAにフォールバックします（停止中のスレッドが必要）。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let data = self.read_via_proc_mem(addr, size)?;
        if data.is_empty() && size > 0 {
            return Ok(self.read_via_ptrace(addr, size));
        }
        Ok(data)
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // 未マッピング領域（EIO）などはそこで打ち切る
                Err(_) => break,
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// 読み取れなかったワード以降は返しません。
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(size);

        for offset in (0..size).step_by(WORD_SIZE) {
            let word_addr = addr.wrapping_add(offset as u64);
            let Ok(word) = ptrace::read(self.pid, word_addr as ptrace::AddressType) else {
                break;
            };
            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(WORD_SIZE);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        data
    }

    /// メモリにデータを書き込み、書き込めたバイト数を返す
    ///
    /// /proc/pid/mem で1バイトも書けなかった場合は PTRACE_POKEDATA にフォールバックします。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let written = self.write_via_proc_mem(addr, data)?;
        if written == 0 && !data.is_empty() {
            return Ok(self.write_via_ptrace(addr, data));
        }
        Ok(written)
    }

    fn write_via_proc_mem(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let mut file = OpenOptions::new().write(true).open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;

        let mut written = 0;
        while written < data.len() {
            match file.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        Ok(written)
    }

    /// PTRACE_POKEDATAでワード単位に書き込む
    ///
    /// ワードの一部だけを書き換える場合は、元の内容を読み取ってから合成します。
    fn write_via_ptrace(&self, addr: u64, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let word_addr = addr.wrapping_add(written as u64);
            let chunk = (data.len() - written).min(WORD_SIZE);

            let mut bytes = if chunk == WORD_SIZE {
                [0u8; WORD_SIZE]
            } else {
                match ptrace::read(self.pid, word_addr as ptrace::AddressType) {
                    Ok(word) => word.to_ne_bytes(),
                    Err(_) => break,
                }
            };
            bytes[..chunk].copy_from_slice(&data[written..written + chunk]);

            let word = i64::from_ne_bytes(bytes);
            // SAFETY: PTRACE_POKEDATAはdataをワード値として扱い、ポインタとしては参照しない
            let ret = unsafe {
                libc::ptrace(
                    libc::PTRACE_POKEDATA,
                    self.pid.as_raw(),
                    word_addr as *mut libc::c_void,
                    word as *mut libc::c_void,
                )
            };
            if Errno::result(ret).is_err() {
                break;
            }
            written += chunk;
        }
        written
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.read(addr, 1)?
            .first()
            .copied()
            .ok_or_else(|| TargetError::MemoryFault {
                addr,
                reason: "address is not readable".to_string(),
            })
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write_all(addr, &[value])
    }

    /// 全バイトを書き込む（部分書き込みはエラー）
    pub fn write_all(&self, addr: u64, data: &[u8]) -> Result<()> {
        let written = self.write(addr, data)?;
        if written != data.len() {
            return Err(TargetError::MemoryFault {
                addr,
                reason: format!("short write ({} of {} bytes)", written, data.len()),
            });
        }
        Ok(())
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)?;

        let mut mappings = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Some(mapping) = MemoryMapping::parse(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }
}
