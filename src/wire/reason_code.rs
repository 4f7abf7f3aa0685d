use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Reason codes carried by JOIN_REFUSE, LEAVING, CONNECT_REFUSE and DISCONNECTING
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ReasonCode {
    Nonspecific = 1,
    IllegalParams = 2,
    LowResources = 3,
    AlreadyMember = 4,
    BadAddr = 5,
    NoReciprocal = 6,
    ChannelExpired = 7,
    LostSequence = 8,
    Saturated = 9,
    AddrChanging = 10,
    AskedToLeave = 11,
    NoRecipient = 12,
    OnlyUnicast = 13,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nonspecific(1, Some(ReasonCode::Nonspecific))]
    #[case::lost_sequence(8, Some(ReasonCode::LostSequence))]
    #[case::only_unicast(13, Some(ReasonCode::OnlyUnicast))]
    #[case::zero(0, None)]
    #[case::out_of_range(14, None)]
    fn test_from_wire(#[case] raw: u8, #[case] expected: Option<ReasonCode>) {
        assert_eq!(ReasonCode::try_from_primitive(raw).ok(), expected);
    }
}
