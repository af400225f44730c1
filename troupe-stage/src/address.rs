//! Global actor identity.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use troupe::Live;
use uuid::Uuid;

/// Globally unique, immutable actor identity: the actor's id together
/// with the id of the stage it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub actor: Uuid,
    pub stage: Uuid,
}

impl Address {
    pub fn new(actor: Uuid, stage: Uuid) -> Self {
        Address { actor, stage }
    }

    pub fn to_live(self) -> Live {
        Live::map([
            ("actor", Live::from(self.actor)),
            ("stage", Live::from(self.stage)),
        ])
    }

    pub fn from_live(value: &Live) -> Option<Address> {
        let actor = value.get("actor")?.as_str()?;
        let stage = value.get("stage")?.as_str()?;
        Some(Address {
            actor: Uuid::parse_str(actor).ok()?,
            stage: Uuid::parse_str(stage).ok()?,
        })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor, self.stage)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::Address;

    #[test]
    fn test_live_round_trip() {
        let address = Address::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(Address::from_live(&address.to_live()), Some(address));
    }
}
