//! Contract event ABI definitions and topic hash computation.
//!
//! We define minimal ABIs covering just the events we need to decode.
//! Indexed parameters are always `(entity id, actor?)` in that order; the
//! remaining parameters are ABI-encoded in the data blob as static 32-byte
//! words described by [`EventAbi::data`].

use crate::events::EventType;
use alloy::primitives::{keccak256, B256};

/// How a single 32-byte data word is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    Uint,
    Int,
    Bool,
    Address,
}

#[derive(Debug)]
pub struct EventAbi {
    pub signature: &'static str,
    /// Number of indexed parameters (topics after topic0).
    pub indexed: usize,
    /// Non-indexed words, in order, under their canonical field names.
    pub data: &'static [(&'static str, Word)],
}

/// PoolCreated(uint256 indexed poolId, address indexed creator, uint256 odds,
///             uint256 creatorStake, uint256 eventEndTime, bool useBitr, uint256 timestamp)
const POOL_CREATED: EventAbi = EventAbi {
    signature: "PoolCreated(uint256,address,uint256,uint256,uint256,bool,uint256)",
    indexed: 2,
    data: &[
        ("odds", Word::Uint),
        ("creatorStake", Word::Uint),
        ("eventEndTime", Word::Uint),
        ("useBitr", Word::Bool),
        ("timestamp", Word::Uint),
    ],
};

/// PoolSettled(uint256 indexed poolId, bool creatorSideWon, uint256 timestamp)
const POOL_SETTLED: EventAbi = EventAbi {
    signature: "PoolSettled(uint256,bool,uint256)",
    indexed: 1,
    data: &[("creatorSideWon", Word::Bool), ("timestamp", Word::Uint)],
};

/// BetPlaced(uint256 indexed poolId, address indexed bettor, uint256 amount,
///           bool isForOutcome, bool useBitr, uint256 timestamp)
const BET_PLACED: EventAbi = EventAbi {
    signature: "BetPlaced(uint256,address,uint256,bool,bool,uint256)",
    indexed: 2,
    data: &[
        ("amount", Word::Uint),
        ("isForOutcome", Word::Bool),
        ("useBitr", Word::Bool),
        ("timestamp", Word::Uint),
    ],
};

/// PoolProgress(uint256 indexed poolId, uint256 totalBettorStake,
///              uint256 totalCreatorSideStake, uint256 fillPercentage,
///              uint256 participantCount, uint256 timestamp)
const POOL_PROGRESS: EventAbi = EventAbi {
    signature: "PoolProgress(uint256,uint256,uint256,uint256,uint256,uint256)",
    indexed: 1,
    data: &[
        ("totalBettorStake", Word::Uint),
        ("totalCreatorSideStake", Word::Uint),
        ("fillPercentage", Word::Uint),
        ("participantCount", Word::Uint),
        ("timestamp", Word::Uint),
    ],
};

/// ReputationChanged(uint256 indexed poolId, address indexed user,
///                   int256 delta, uint256 newReputation, uint256 timestamp)
const REPUTATION_CHANGED: EventAbi = EventAbi {
    signature: "ReputationChanged(uint256,address,int256,uint256,uint256)",
    indexed: 2,
    data: &[
        ("delta", Word::Int),
        ("newReputation", Word::Uint),
        ("timestamp", Word::Uint),
    ],
};

/// LiquidityAdded(uint256 indexed poolId, address indexed provider,
///                uint256 amount, uint256 timestamp)
const LIQUIDITY_ADDED: EventAbi = EventAbi {
    signature: "LiquidityAdded(uint256,address,uint256,uint256)",
    indexed: 2,
    data: &[("amount", Word::Uint), ("timestamp", Word::Uint)],
};

/// CycleResolved(uint256 indexed cycleId, uint256 prizePool,
///               uint256 totalSlips, uint256 timestamp)
const CYCLE_RESOLVED: EventAbi = EventAbi {
    signature: "CycleResolved(uint256,uint256,uint256,uint256)",
    indexed: 1,
    data: &[
        ("prizePool", Word::Uint),
        ("totalSlips", Word::Uint),
        ("timestamp", Word::Uint),
    ],
};

/// SlipEvaluated(uint256 indexed cycleId, address indexed player,
///               uint256 slipId, uint256 correctCount, uint256 finalScore, uint256 timestamp)
const SLIP_EVALUATED: EventAbi = EventAbi {
    signature: "SlipEvaluated(uint256,address,uint256,uint256,uint256,uint256)",
    indexed: 2,
    data: &[
        ("slipId", Word::Uint),
        ("correctCount", Word::Uint),
        ("finalScore", Word::Uint),
        ("timestamp", Word::Uint),
    ],
};

/// PrizeClaimed(uint256 indexed cycleId, address indexed player,
///              uint256 rank, uint256 prize, uint256 timestamp)
const PRIZE_CLAIMED: EventAbi = EventAbi {
    signature: "PrizeClaimed(uint256,address,uint256,uint256,uint256)",
    indexed: 2,
    data: &[
        ("rank", Word::Uint),
        ("prize", Word::Uint),
        ("timestamp", Word::Uint),
    ],
};

pub fn event_abi(event_type: EventType) -> &'static EventAbi {
    match event_type {
        EventType::PoolCreated => &POOL_CREATED,
        EventType::PoolSettled => &POOL_SETTLED,
        EventType::BetPlaced => &BET_PLACED,
        EventType::PoolProgress => &POOL_PROGRESS,
        EventType::ReputationChanged => &REPUTATION_CHANGED,
        EventType::LiquidityAdded => &LIQUIDITY_ADDED,
        EventType::CycleResolved => &CYCLE_RESOLVED,
        EventType::SlipEvaluated => &SLIP_EVALUATED,
        EventType::PrizeClaimed => &PRIZE_CLAIMED,
    }
}

/// keccak256 of the event signature, used as topic0 in log filters.
pub fn topic0(event_type: EventType) -> B256 {
    keccak256(event_abi(event_type).signature.as_bytes())
}
