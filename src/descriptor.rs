//! Embedded descriptor-file text builder.
//!
//! The descriptor is a small UTF-8 text block written inside the file at
//! `descriptorOffset*512`, describing extent geometry and disk identity. Its
//! exact line order and quoting match what real VMware tooling expects to
//! find in a streamOptimized extent.

use crate::entropy::Rng;

const MAX_CYLINDERS: u64 = 65535;
const SECTORS_PER_CYLINDER: u64 = 255 * 63;

/// 32-bit content identifiers reserve these two values.
const CID_RESERVED_HIGH: u32 = 0xFFFF_FFFF;
const CID_RESERVED_LOW: u32 = 0xFFFF_FFFE;

/// Draws a content ID from `rng`, avoiding the two reserved sentinel values.
pub fn random_cid(rng: &mut Rng) -> u32 {
    loop {
        let candidate = rng.next_u32();
        if candidate != CID_RESERVED_HIGH && candidate != CID_RESERVED_LOW {
            return candidate;
        }
    }
}

fn cylinders_for(capacity_sectors: u64) -> u64 {
    capacity_sectors.div_ceil(SECTORS_PER_CYLINDER).min(MAX_CYLINDERS)
}

/// Builds the descriptor text for a freshly closed streamOptimized extent.
///
/// `filename` is the name by which the extent is referenced in its own
/// `RW ... SPARSE` line (a streamOptimized file is self-contained, so this is
/// normally the file's own basename). `tools_version` mirrors
/// `ddb.toolsVersion`, a free-form string supplied by the caller rather than
/// invented here — this crate has no VMware Tools install to introspect.
pub fn build(
    capacity_sectors: u64,
    cid: u32,
    rng: &mut Rng,
    filename: &str,
    tools_version: &str,
) -> String {
    let r1 = rng.next_u32();
    let r2 = rng.next_u32();
    let r3 = rng.next_u32();
    let cylinders = cylinders_for(capacity_sectors);

    format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         encoding=\"UTF-8\"\n\
         CID={cid:08x}\n\
         parentCID=ffffffff\n\
         createType=\"streamOptimized\"\n\
         \n\
         # Extent description\n\
         RW {capacity_sectors} SPARSE \"{filename}\"\n\
         \n\
         # The Disk Data Base\n\
         #DDB\n\
         \n\
         ddb.longContentID = \"{r1:08x}{r2:08x}{r3:08x}{cid:08x}\"\n\
         ddb.virtualHWVersion = \"4\"\n\
         ddb.geometry.cylinders = \"{cylinders}\"\n\
         ddb.geometry.heads = \"255\"\n\
         ddb.geometry.sectors = \"63\"\n\
         ddb.adapterType = \"lsilogic\"\n\
         ddb.toolsInstallType = \"4\"\n\
         ddb.toolsVersion = \"{tools_version}\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_cid_never_returns_reserved_values() {
        let mut rng = Rng::seeded(7);
        for _ in 0..10_000 {
            let cid = random_cid(&mut rng);
            assert_ne!(cid, CID_RESERVED_HIGH);
            assert_ne!(cid, CID_RESERVED_LOW);
        }
    }

    #[test]
    fn cylinders_are_capped_at_65535() {
        assert_eq!(cylinders_for(u64::MAX / 2), MAX_CYLINDERS);
    }

    #[test]
    fn small_capacity_rounds_up_to_one_cylinder() {
        assert_eq!(cylinders_for(1), 1);
    }

    #[test]
    fn descriptor_has_no_trailing_newline_and_contains_expected_fields() {
        let mut rng = Rng::seeded(1);
        let text = build(2048, 0xDEAD_BEEF, &mut rng, "disk-flat.vmdk", "16.0.0");
        assert!(!text.ends_with('\n'));
        assert!(text.starts_with("# Disk DescriptorFile\n"));
        assert!(text.contains("CID=deadbeef"));
        assert!(text.contains("RW 2048 SPARSE \"disk-flat.vmdk\""));
        assert!(text.contains("ddb.toolsVersion = \"16.0.0\""));
    }
}
