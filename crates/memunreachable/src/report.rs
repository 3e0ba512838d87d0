//! Public report types and the leak log format.

use crate::pipe::Plain;

/// How many leading bytes of each leak are captured into the report.
pub const CONTENTS_LEN: usize = 32;

/// One unreachable allocation.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Leak {
    /// Start address of the allocation.
    pub begin: usize,
    /// Size in bytes as tracked by the allocator.
    pub size: usize,
    /// The first bytes of the allocation, zero-filled past `size` or where
    /// the copy could not complete.
    pub contents: [u8; CONTENTS_LEN],
}

// Fixed-size fields only; the byte image crosses the leak pipe as-is.
unsafe impl Plain for Leak {}

impl Leak {
    /// The captured prefix: at most `CONTENTS_LEN` bytes, at most `size`.
    pub fn contents(&self) -> &[u8] {
        &self.contents[..self.size.min(CONTENTS_LEN)]
    }
}

impl std::fmt::Debug for Leak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leak")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("size", &self.size)
            .finish()
    }
}

/// The result of one collection.
#[derive(Debug, Default)]
pub struct UnreachableMemoryInfo {
    /// Allocations known to the walker.
    pub num_allocations: usize,
    /// Bytes across all known allocations.
    pub allocation_bytes: usize,
    /// Unreachable allocations, including any beyond the report limit.
    pub num_leaks: usize,
    /// Unreachable bytes, including any beyond the report limit.
    pub leak_bytes: usize,
    /// Up to `limit` leaks, largest first.
    pub leaks: Vec<Leak>,
}

pub(crate) fn log_summary(info: &UnreachableMemoryInfo) {
    tracing::error!(
        "{} bytes in {} allocation{} unreachable out of {} bytes in {} allocation{}",
        info.leak_bytes,
        info.num_leaks,
        plural(info.num_leaks),
        info.allocation_bytes,
        info.num_allocations,
        plural(info.num_allocations),
    );
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

pub(crate) fn log_leak(leak: &Leak, log_contents: bool) {
    tracing::error!(
        "unreachable allocation at {:x} of approximate size {}",
        leak.begin,
        leak.size
    );

    if log_contents {
        for line in hex_dump(leak.begin, leak.contents()) {
            tracing::error!("{}", line);
        }
    }
}

const BYTES_PER_LINE: usize = 16;

/// Renders `bytes` as 16-byte hex+ASCII lines, addresses starting at `begin`.
fn hex_dump(begin: usize, bytes: &[u8]) -> Vec<String> {
    use std::fmt::Write;

    let mut lines = Vec::with_capacity(bytes.len().div_ceil(BYTES_PER_LINE));
    for (i, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        let mut line = String::new();
        let _ = write!(line, "{:x}: ", begin + i * BYTES_PER_LINE);
        for b in chunk {
            let _ = write!(line, "{:02x} ", b);
        }
        for _ in chunk.len()..BYTES_PER_LINE {
            line.push_str("   ");
        }
        for &b in chunk {
            line.push(if (b' '..0x7f).contains(&b) {
                b as char
            } else {
                '.'
            });
        }
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_full_line() {
        let bytes: Vec<u8> = (0x41..0x51).collect();
        let lines = hex_dump(0x1000, &bytes);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "1000: 41 42 43 44 45 46 47 48 49 4a 4b 4c 4d 4e 4f 50 ABCDEFGHIJKLMNOP"
        );
    }

    #[test]
    fn hex_dump_partial_line_pads_hex_column() {
        let lines = hex_dump(0x2000, b"Hi\x00");
        assert_eq!(lines.len(), 1);
        // Hex column is always 16 * 3 characters wide before the ASCII part.
        let expected = format!("2000: 48 69 00 {}Hi.", " ".repeat(13 * 3));
        assert_eq!(lines[0], expected);
    }

    #[test]
    fn hex_dump_multiple_lines_advance_address() {
        let bytes = [0u8; 32];
        let lines = hex_dump(0x10, &bytes);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("10: "));
        assert!(lines[1].starts_with("20: "));
    }

    #[test]
    fn hex_dump_unprintable_bytes_become_dots() {
        let lines = hex_dump(0, &[0x00, 0x1f, 0x7f, 0xff]);
        assert!(lines[0].ends_with("...."));
    }

    #[test]
    fn leak_contents_clamped_to_size() {
        let leak = Leak {
            begin: 0x1000,
            size: 5,
            contents: [0xaa; CONTENTS_LEN],
        };
        assert_eq!(leak.contents().len(), 5);

        let big = Leak {
            begin: 0x1000,
            size: 1000,
            contents: [0xaa; CONTENTS_LEN],
        };
        assert_eq!(big.contents().len(), CONTENTS_LEN);
    }
}
