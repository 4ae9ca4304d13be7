//! Master Election
//!
//! Nodes elect a master through messages carried in their own status
//! blocks. The lowest running node id bids, every other node acks the
//! lowest bidder it can see, and the bidder takes the master role once all
//! running nodes have acked it for long enough.

use tracing::{debug, error, info};

use super::tracker::NodeTracker;
use crate::cluster::ClusterMember;
use crate::protocol::{MemberMask, Message, MessageId, NodeState};

/// Outcome of scanning the disk for a master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterScan {
    /// Node id of the first master found
    pub master: Option<u32>,
    /// Lowest running node id, including ours
    pub low_id: u32,
    /// Number of masters found
    pub count: u32,
}

/// Result of counting votes for our bid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Every running node acked us
    AllAcked,
    /// Someone nacked us
    Nacked,
    /// A lower node id is bidding; we now vote for it
    LowerBidder,
    /// Keep waiting
    Pending,
}

/// What the local node should do with the cluster manager this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No master yet; election in progress
    Electing,
    /// We are the master
    Master,
    /// Another node is master
    Follower {
        master: u32,
        /// The master's quorate set includes us
        included: bool,
    },
    /// We think we are master but another node claims the role
    Conflict { master: u32 },
    /// Not participating (downgraded or initializing)
    Idle,
}

/// Local election state
#[derive(Debug, Clone)]
pub struct MasterElection {
    my_id: u32,
    master_wait: u32,
    msg: Message,
    bid_pending: u32,
    upgrade: u32,
}

impl MasterElection {
    pub fn new(my_id: u32, master_wait: u32) -> Self {
        Self {
            my_id,
            master_wait,
            msg: Message::default(),
            bid_pending: 0,
            upgrade: 0,
        }
    }

    /// Message to publish in our status block
    pub fn message(&self) -> Message {
        self.msg
    }

    pub fn bid_pending(&self) -> u32 {
        self.bid_pending
    }

    /// Drop any bid or vote, as on a fitness downgrade
    pub fn clear(&mut self) {
        self.msg = Message {
            id: MessageId::None,
            arg: 0,
            seq: self.msg.seq.wrapping_add(1),
        };
        self.bid_pending = 0;
    }

    /// Start the grace period after a fitness upgrade
    pub fn start_upgrade(&mut self, upgrade_wait: u32) {
        self.upgrade = upgrade_wait;
        self.clear();
    }

    /// Count down the upgrade grace period; called once per cycle
    pub fn tick(&mut self) {
        self.upgrade = self.upgrade.saturating_sub(1);
    }

    /// Find the current master and the lowest running node id
    pub fn master_exists(&self, tracker: &NodeTracker) -> MasterScan {
        let mut scan = MasterScan {
            master: None,
            low_id: self.my_id,
            count: 0,
        };

        for info in tracker.nodes() {
            let node_id = info.node_id();

            if node_id == self.my_id {
                if info.status.state == NodeState::Master {
                    scan.master.get_or_insert(node_id);
                    scan.count += 1;
                }
                continue;
            }

            if info.state.is_running() && info.status.state == NodeState::Master {
                scan.master.get_or_insert(node_id);
                scan.count += 1;
                continue;
            }

            if !info.state.is_running() {
                if info.status.state == NodeState::Master {
                    debug!("Node {} is marked master, but is dead", node_id);
                }
                continue;
            }

            scan.low_id = scan.low_id.min(node_id);
        }

        if scan.count > 1 {
            error!("{} nodes claim to be master", scan.count);
        }

        scan
    }

    /// Ack the lowest running node bidding with an id below ours
    pub fn do_vote(&mut self, tracker: &NodeTracker) {
        let bidder = tracker.nodes().iter().find(|info| {
            info.state == NodeState::Run
                && info.status.message.id == MessageId::Bid
                && info.node_id() < self.my_id
        });

        if let Some(info) = bidder {
            self.msg = Message::ack(info.node_id(), info.status.message.seq);
        }
    }

    /// Count votes for our bid; switch to acking a lower bidder if any
    pub fn check_votes(&mut self, tracker: &NodeTracker) -> VoteOutcome {
        let mut running = 0;
        let mut acks = 0;
        let mut nacks = 0;
        let mut low_id = self.my_id;

        for info in tracker.nodes() {
            if !info.state.is_live() {
                continue;
            }
            running += 1;

            let message = info.status.message;
            if message.arg == self.my_id {
                match message.id {
                    MessageId::Ack => acks += 1,
                    MessageId::Nack => nacks += 1,
                    _ => {}
                }
            }

            if message.id == MessageId::Bid && info.node_id() < low_id {
                low_id = info.node_id();
                self.msg = Message::ack(low_id, message.seq);
            }
        }

        if acks == running {
            VoteOutcome::AllAcked
        } else if nacks > 0 {
            VoteOutcome::Nacked
        } else if low_id != self.my_id {
            VoteOutcome::LowerBidder
        } else {
            VoteOutcome::Pending
        }
    }

    /// Run one election round and update our state
    pub fn step(&mut self, state: &mut NodeState, scan: &MasterScan, tracker: &NodeTracker) -> Role {
        match scan.master {
            None => {
                if scan.low_id == self.my_id
                    && *state == NodeState::Run
                    && self.bid_pending == 0
                    && self.upgrade == 0
                {
                    debug!("Making bid for master");
                    self.msg = Message::bid(self.msg.seq.wrapping_add(1));
                    self.bid_pending = 1;
                } else if self.bid_pending == 0 {
                    self.do_vote(tracker);
                } else {
                    self.bid_pending += 1;
                    match self.check_votes(tracker) {
                        VoteOutcome::AllAcked if self.bid_pending >= self.master_wait => {
                            info!("Assuming master role");
                            *state = NodeState::Master;
                            self.msg.id = MessageId::None;
                            self.bid_pending = 0;
                        }
                        VoteOutcome::Nacked => {
                            self.msg.id = MessageId::None;
                            self.bid_pending = 0;
                        }
                        VoteOutcome::LowerBidder => self.bid_pending = 0,
                        VoteOutcome::AllAcked | VoteOutcome::Pending => {}
                    }
                }

                Role::Electing
            }
            Some(master) if *state == NodeState::Master && master != self.my_id => {
                Role::Conflict { master }
            }
            Some(master) if *state == NodeState::Master => {
                debug_assert_eq!(master, self.my_id);
                Role::Master
            }
            Some(master) if *state == NodeState::Run && master != self.my_id => {
                let included = tracker
                    .node(master)
                    .map(|info| info.status.master_mask.is_set(self.my_id))
                    .unwrap_or(false);
                Role::Follower { master, included }
            }
            Some(_) => Role::Idle,
        }
    }
}

/// Our membership view restricted to nodes the cluster manager calls members
pub fn master_mask(mask: &MemberMask, members: &[ClusterMember]) -> MemberMask {
    let mut out = MemberMask::default();
    for member in members {
        if member.member && mask.is_set(member.node_id) {
            out.set(member.node_id);
        }
    }
    out
}
