// Справочник известных пользователей (участники комнат)
// Нужен нормализатору, когда payload не несёт имени или роли отправителя

use crate::protocol::messages::{Participant, RawId};
use crate::protocol::normalize::normalize_role;
use crate::storage::models::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Известный пользователь
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownUser {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

impl KnownUser {
    /// Собрать из участника комнаты; участник без id пропускается
    pub fn from_participant(participant: &Participant) -> Option<Self> {
        let id = participant.id.as_ref().and_then(RawId::to_id_string)?;
        let full_name = [participant.first_name.as_deref(), participant.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let display_name = participant
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| (!full_name.is_empty()).then_some(full_name));

        Some(Self {
            id,
            display_name,
            email: participant.email.clone(),
            role: participant.role.as_deref().and_then(normalize_role),
        })
    }
}

/// Справочник пользователей
#[derive(Debug, Clone, Default)]
pub struct Directory {
    users: HashMap<String, KnownUser>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Справочник из участников комнаты
    pub fn from_participants(participants: &[Participant]) -> Self {
        let mut directory = Self::new();
        for user in participants.iter().filter_map(KnownUser::from_participant) {
            directory.upsert(user);
        }
        directory
    }

    /// Добавить или обновить пользователя
    pub fn upsert(&mut self, user: KnownUser) {
        self.users.insert(user.id.clone(), user);
    }

    /// Получить пользователя по ID
    pub fn get(&self, user_id: &str) -> Option<&KnownUser> {
        self.users.get(user_id)
    }

    pub fn display_name(&self, user_id: &str) -> Option<&str> {
        self.get(user_id).and_then(|u| u.display_name.as_deref())
    }

    pub fn role(&self, user_id: &str) -> Option<Role> {
        self.get(user_id).and_then(|u| u.role)
    }

    /// Количество пользователей
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Слить другой справочник поверх текущего
    pub fn merge(&mut self, other: Directory) {
        self.users.extend(other.users);
    }
}
