//! Which fields of each transfer are recorded and which are only checked.
//!
//! A [`Recordable`] type lists its steps once; the engine walks the list
//! in order for recording, replaying and checking, so there is a single
//! generic transfer routine instead of one per hypercall.

use ukvm_protocol::{
    abi_struct, AbiStruct, BlkInfo, BlkRead, BlkWrite, Exec, Field, Halt, NetInfo, NetRead,
    NetWrite, Poll, Puts,
};

/// One item of a transfer plan.
#[derive(Clone, Copy, Debug)]
pub enum Step {
    /// Compared between record and replay in checked mode; never replayed.
    Check(Field),
    /// Logged on record, injected on replay.
    Record(Field),
    /// The guest buffer `[data, data + len)`, checked only.
    CheckBuffer { data: Field, len: Field },
    /// The guest buffer `[data, data + len)`, logged and injected.  `len`
    /// must be recorded by an earlier step when it is an output.
    RecordBuffer { data: Field, len: Field },
}

/// A value that crosses the record/replay boundary.
pub trait Recordable: AbiStruct {
    /// Call-site name used to tag log entries.
    const SITE: &'static str;
    const PLAN: &'static [Step];
    /// Re-executed on replay instead of injected.  Used for calls whose
    /// effect is purely a function of guest state.
    const REDO: bool = false;
}

abi_struct! {
    /// Result of an emulated `RDTSC`.
    pub struct TscValue {
        pub value: u64 => VALUE,
    }
}

abi_struct! {
    /// Result of an emulated `RDRAND`.
    pub struct RandValue {
        pub value: u64 => VALUE,
    }
}

abi_struct! {
    /// Query and result of an emulated `CPUID`.
    pub struct CpuidValue {
        pub leaf: u32 => LEAF,
        pub subleaf: u32 => SUBLEAF,
        pub eax: u32 => EAX,
        pub ebx: u32 => EBX,
        pub ecx: u32 => ECX,
        pub edx: u32 => EDX,
    }
}

impl Recordable for Puts {
    const SITE: &'static str = "puts";
    const PLAN: &'static [Step] = &[Step::Check(Puts::DATA), Step::Check(Puts::LEN)];
    const REDO: bool = true;
}

impl Recordable for Poll {
    const SITE: &'static str = "poll";
    const PLAN: &'static [Step] = &[Step::Check(Poll::TIMEOUT_NSECS), Step::Record(Poll::RET)];
}

impl Recordable for BlkInfo {
    const SITE: &'static str = "blkinfo";
    const PLAN: &'static [Step] = &[
        Step::Record(BlkInfo::SECTOR_SIZE),
        Step::Record(BlkInfo::NUM_SECTORS),
        Step::Record(BlkInfo::RW),
    ];
}

impl Recordable for BlkWrite {
    const SITE: &'static str = "blkwrite";
    const PLAN: &'static [Step] = &[
        Step::Check(BlkWrite::SECTOR),
        Step::Check(BlkWrite::DATA),
        Step::Check(BlkWrite::LEN),
        Step::CheckBuffer { data: BlkWrite::DATA, len: BlkWrite::LEN },
        Step::Record(BlkWrite::RET),
    ];
}

impl Recordable for BlkRead {
    const SITE: &'static str = "blkread";
    const PLAN: &'static [Step] = &[
        Step::Check(BlkRead::SECTOR),
        Step::Check(BlkRead::DATA),
        Step::Record(BlkRead::LEN),
        Step::RecordBuffer { data: BlkRead::DATA, len: BlkRead::LEN },
        Step::Record(BlkRead::RET),
    ];
}

impl Recordable for NetInfo {
    const SITE: &'static str = "netinfo";
    const PLAN: &'static [Step] = &[Step::Record(NetInfo::MAC_STR)];
}

impl Recordable for NetWrite {
    const SITE: &'static str = "netwrite";
    const PLAN: &'static [Step] = &[
        Step::Check(NetWrite::DATA),
        Step::Check(NetWrite::LEN),
        Step::CheckBuffer { data: NetWrite::DATA, len: NetWrite::LEN },
        Step::Record(NetWrite::RET),
    ];
}

impl Recordable for NetRead {
    const SITE: &'static str = "netread";
    const PLAN: &'static [Step] = &[
        Step::Check(NetRead::DATA),
        Step::Record(NetRead::LEN),
        Step::RecordBuffer { data: NetRead::DATA, len: NetRead::LEN },
        Step::Record(NetRead::RET),
    ];
}

impl Recordable for Exec {
    const SITE: &'static str = "exec";
    const PLAN: &'static [Step] = &[Step::Check(Exec::ELF_MEM), Step::Check(Exec::ELF_MEM_LEN)];
    const REDO: bool = true;
}

impl Recordable for Halt {
    const SITE: &'static str = "halt";
    const PLAN: &'static [Step] = &[Step::Check(Halt::EXIT_STATUS)];
    const REDO: bool = true;
}

impl Recordable for TscValue {
    const SITE: &'static str = "rdtsc";
    const PLAN: &'static [Step] = &[Step::Record(TscValue::VALUE)];
}

impl Recordable for RandValue {
    const SITE: &'static str = "rdrand";
    const PLAN: &'static [Step] = &[Step::Record(RandValue::VALUE)];
}

impl Recordable for CpuidValue {
    const SITE: &'static str = "cpuid";
    const PLAN: &'static [Step] = &[
        Step::Check(CpuidValue::LEAF),
        Step::Check(CpuidValue::SUBLEAF),
        Step::Record(CpuidValue::EAX),
        Step::Record(CpuidValue::EBX),
        Step::Record(CpuidValue::ECX),
        Step::Record(CpuidValue::EDX),
    ];
}

/// Log tag for one step of a call site, e.g. `blkread.len`.
pub fn entry_name(site: &str, item: &str) -> String {
    format!("{}.{}", site, item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded_names<T: Recordable>() -> Vec<&'static str> {
        T::PLAN
            .iter()
            .filter_map(|s| match s {
                Step::Record(f) => Some(f.name),
                Step::RecordBuffer { .. } => Some("buffer"),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffer_length_recorded_before_buffer() {
        assert_eq!(recorded_names::<BlkRead>(), vec!["len", "buffer", "ret"]);
        assert_eq!(recorded_names::<NetRead>(), vec!["len", "buffer", "ret"]);
    }

    #[test]
    fn redo_calls_record_nothing() {
        assert!(recorded_names::<Puts>().is_empty());
        assert!(recorded_names::<Exec>().is_empty());
        assert!(recorded_names::<Halt>().is_empty());
    }

    #[test]
    fn entry_names_fit_in_log_tags() {
        fn longest<T: Recordable>() -> usize {
            T::PLAN
                .iter()
                .map(|s| match s {
                    Step::Check(f) | Step::Record(f) => entry_name(T::SITE, f.name).len(),
                    _ => entry_name(T::SITE, "buffer").len(),
                })
                .max()
                .unwrap_or(0)
        }
        for len in [
            longest::<Puts>(),
            longest::<Poll>(),
            longest::<BlkInfo>(),
            longest::<BlkWrite>(),
            longest::<BlkRead>(),
            longest::<NetInfo>(),
            longest::<NetWrite>(),
            longest::<NetRead>(),
            longest::<Exec>(),
            longest::<Halt>(),
            longest::<TscValue>(),
            longest::<RandValue>(),
            longest::<CpuidValue>(),
        ] {
            assert!(len <= ukvm_rr::log::SITE_NAME_MAX);
        }
    }
}
