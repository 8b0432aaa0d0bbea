use std::{fmt, net::Ipv6Addr};

use derivative::Derivative;
use zerocopy::{
    byteorder::{BigEndian, U16, U32, U64},
    AsBytes, FromBytes, FromZeroes,
};

use super::Record;
use crate::error::HandshakeError;

const PSN_MASK: u32 = 0x00ff_ffff;

/// What one queue pair tells the remote side about itself.
#[derive(Derivative)]
#[derivative(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerDestination {
    pub lid: u16,
    pub out_reads: u32,
    pub qpn: u32,
    pub psn: u32,
    pub rkey: u32,
    pub vaddr: u64,
    #[derivative(Debug(format_with = "fmt_gid"))]
    pub gid: [u8; 16],
    pub srqn: u32,
}

fn fmt_gid(gid: &[u8; 16], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", Ipv6Addr::from(*gid))
}

/// Address family encoded in a GID. RoCE v2 carries IPv4 addresses as v4-mapped IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GidKind {
    Ipv4,
    Ipv6,
}

impl GidKind {
    pub fn of(gid: &[u8; 16]) -> Self {
        match Ipv6Addr::from(*gid).to_ipv4_mapped() {
            Some(_) => GidKind::Ipv4,
            None => GidKind::Ipv6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GidKind::Ipv4 => "IPv4",
            GidKind::Ipv6 => "IPv6",
        }
    }
}

impl PeerDestination {
    pub fn gid_kind(&self) -> GidKind {
        GidKind::of(&self.gid)
    }
}

impl fmt::Display for PeerDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " LID {:#06x} QPN {:#08x} PSN {:#08x} RKey {:#010x} VAddr {:#018x} GID {}",
            self.lid,
            self.qpn,
            self.psn,
            self.rkey,
            self.vaddr,
            Ipv6Addr::from(self.gid)
        )
    }
}

#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DestinationWire {
    lid: U16<BigEndian>,
    out_reads: U32<BigEndian>,
    qpn: U32<BigEndian>,
    psn: U32<BigEndian>,
    rkey: U32<BigEndian>,
    vaddr: U64<BigEndian>,
    gid: [u8; 16],
    srqn: U32<BigEndian>,
}

impl Record for PeerDestination {
    const NAME: &'static str = "queue pair destination";

    type Wire = DestinationWire;

    fn to_wire(&self) -> DestinationWire {
        DestinationWire {
            lid: U16::new(self.lid),
            out_reads: U32::new(self.out_reads),
            qpn: U32::new(self.qpn),
            psn: U32::new(self.psn),
            rkey: U32::new(self.rkey),
            vaddr: U64::new(self.vaddr),
            gid: self.gid,
            srqn: U32::new(self.srqn),
        }
    }

    fn from_wire(wire: DestinationWire) -> Result<Self, HandshakeError> {
        let psn = wire.psn.get();
        if psn & !PSN_MASK != 0 {
            return Err(HandshakeError::Malformed {
                record: Self::NAME,
                reason: format!("packet sequence number {psn:#x} exceeds 24 bits"),
            });
        }

        Ok(PeerDestination {
            lid: wire.lid.get(),
            out_reads: wire.out_reads.get(),
            qpn: wire.qpn.get(),
            psn,
            rkey: wire.rkey.get(),
            vaddr: wire.vaddr.get(),
            gid: wire.gid,
            srqn: wire.srqn.get(),
        })
    }
}

/// A random 24-bit initial packet sequence number.
pub fn random_psn() -> u32 {
    rand::random::<u32>() & PSN_MASK
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn wire_layout_is_fixed() {
        assert_eq!(std::mem::size_of::<DestinationWire>(), 46);

        let dest = PeerDestination {
            lid: 0x0102,
            qpn: 0x0a0b0c,
            ..Default::default()
        };
        let wire = dest.to_wire();
        assert_eq!(&wire.as_bytes()[..2], &[0x01, 0x02]);
        assert_eq!(&wire.as_bytes()[6..10], &[0x00, 0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn oversized_psn_is_rejected() {
        let dest = PeerDestination {
            psn: 0x0100_0000,
            ..Default::default()
        };
        assert!(PeerDestination::from_wire(dest.to_wire()).is_err());
        assert!(random_psn() <= PSN_MASK);
    }

    #[test]
    fn gid_kind_follows_address_family() {
        let v4 = Ipv4Addr::new(192, 168, 1, 7).to_ipv6_mapped().octets();
        assert_eq!(GidKind::of(&v4), GidKind::Ipv4);

        let v6: Ipv6Addr = "fe80::b8ce:f6ff:fe3c:1a2b".parse().unwrap();
        assert_eq!(GidKind::of(&v6.octets()), GidKind::Ipv6);

        // Plain InfiniBand ports report an all-zero GID.
        assert_eq!(GidKind::of(&[0; 16]), GidKind::Ipv6);
    }
}
