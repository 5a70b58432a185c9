use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Elderly,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Elderly => "elderly",
            Role::Student => "student",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "elderly" => Ok(Role::Elderly),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One side of a conversation, keyed by the column that stores its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participant {
    Elderly(Uuid),
    Student(Uuid),
}

impl Participant {
    pub fn id(&self) -> Uuid {
        match self {
            Participant::Elderly(id) | Participant::Student(id) => *id,
        }
    }

    /// Column holding this participant's id on `conversations`.
    pub fn column(&self) -> &'static str {
        match self {
            Participant::Elderly(_) => "elderly_id",
            Participant::Student(_) => "student_id",
        }
    }

    /// Column holding the other side's id on `conversations`.
    pub fn counterpart_column(&self) -> &'static str {
        match self {
            Participant::Elderly(_) => "student_id",
            Participant::Student(_) => "elderly_id",
        }
    }
}

/// Authenticated caller of a service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn elderly(id: Uuid) -> Self {
        Self { id, role: Role::Elderly }
    }

    pub fn student(id: Uuid) -> Self {
        Self { id, role: Role::Student }
    }

    pub fn participant(&self) -> Participant {
        match self.role {
            Role::Elderly => Participant::Elderly(self.id),
            Role::Student => Participant::Student(self.id),
        }
    }

    pub fn require(&self, role: Role) -> crate::error::Result<()> {
        if self.role != role {
            return Err(crate::error::Error::Forbidden(format!(
                "Only {} accounts can perform this action",
                role.as_str()
            )));
        }
        Ok(())
    }
}
