//! 허용 목록 — CIDR 블록과 예약 주소 클래스
//!
//! [`AllowList::contains`]는 루프백/미지정/멀티캐스트 주소를 무조건
//! 허용하고, 그 외에는 등록된 CIDR 블록이 주소를 덮는지 검사합니다.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::ConfigError;

/// 예약 주소 클래스
///
/// 위치 조회를 생략하고 상수 레이블로 대체되는 주소 부류입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    Private,
    LinkLocalUnicast,
    Unspecified,
    InterfaceLocalMulticast,
    LinkLocalMulticast,
    Multicast,
    Broadcast,
}

impl AddressClass {
    /// 주소의 예약 클래스를 판별합니다. 일반 주소면 `None`입니다.
    pub fn of(ip: &IpAddr) -> Option<Self> {
        if ip.is_loopback() {
            return Some(Self::Loopback);
        }
        if is_private(ip) {
            return Some(Self::Private);
        }
        if is_link_local_unicast(ip) {
            return Some(Self::LinkLocalUnicast);
        }
        if ip.is_unspecified() {
            return Some(Self::Unspecified);
        }
        if is_interface_local_multicast(ip) {
            return Some(Self::InterfaceLocalMulticast);
        }
        if is_link_local_multicast(ip) {
            return Some(Self::LinkLocalMulticast);
        }
        if ip.is_multicast() {
            return Some(Self::Multicast);
        }
        if *ip == IpAddr::V4(Ipv4Addr::BROADCAST) {
            return Some(Self::Broadcast);
        }
        None
    }

    /// 위치 조회 대체 레이블
    pub fn location_label(&self) -> &'static str {
        match self {
            Self::Loopback => "localhost",
            Self::Private => "private",
            Self::LinkLocalUnicast => "link-local-unicast",
            Self::Unspecified => "unspecified",
            Self::InterfaceLocalMulticast => "interface-local-multicast",
            Self::LinkLocalMulticast => "link-local-multicast",
            Self::Multicast => "multicast",
            Self::Broadcast => "broadcast",
        }
    }

    fn is_multicast(&self) -> bool {
        matches!(
            self,
            Self::InterfaceLocalMulticast | Self::LinkLocalMulticast | Self::Multicast
        )
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7 unique local
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn is_link_local_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_interface_local_multicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        // ff01::/16
        IpAddr::V6(v6) => v6.is_multicast() && (v6.segments()[0] & 0x000f) == 0x01,
    }
}

fn is_link_local_multicast(ip: &IpAddr) -> bool {
    match ip {
        // 224.0.0.0/24
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 224 && o[1] == 0 && o[2] == 0
        }
        // ff02::/16
        IpAddr::V6(v6) => v6.is_multicast() && (v6.segments()[0] & 0x000f) == 0x02,
    }
}

/// 주소를 16바이트 키로 정규화합니다 (IPv4는 mapped 형식).
pub fn fixed_key(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// CIDR 블록의 순서 있는 목록
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    nets: Vec<IpNet>,
}

impl AllowList {
    /// CIDR 문자열 목록으로 허용 목록을 만듭니다.
    pub fn from_cidrs<I, S>(cidrs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for s in cidrs {
            let s = s.as_ref();
            let net: IpNet = s.parse().map_err(|e| ConfigError::BadCidr {
                value: s.to_owned(),
                reason: format!("{e}"),
            })?;
            list.push(net);
        }
        Ok(list)
    }

    /// 블록을 추가합니다. 동일 블록은 중복 등록되지 않습니다.
    pub fn push(&mut self, net: IpNet) {
        if !self.nets.contains(&net) {
            self.nets.push(net);
        }
    }

    /// 다른 목록의 블록을 이어붙입니다 (중복 제거).
    pub fn merge(&mut self, other: &AllowList) {
        for net in &other.nets {
            self.push(*net);
        }
    }

    /// 주소 허용 여부.
    ///
    /// 루프백/미지정/멀티캐스트는 무조건 true, 그 외에는 블록 매칭.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if let Some(class) = AddressClass::of(ip) {
            if matches!(class, AddressClass::Loopback | AddressClass::Unspecified)
                || class.is_multicast()
            {
                return true;
            }
        }
        self.nets.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }
}

impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let cidrs = Vec::<String>::deserialize(deserializer)?;
        Self::from_cidrs(cidrs).map_err(serde::de::Error::custom)
    }
}
