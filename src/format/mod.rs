/// MPEG transport stream packet, section and PES parsing
pub mod ts;

pub use self::ts::{PesHeader, SectionHeader, TsHeader, TsPacket};
