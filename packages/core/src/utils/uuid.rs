// UUID утилиты

pub fn generate_v4() -> String {
    ::uuid::Uuid::new_v4().to_string()
}

/// Новый correlation id для исходящего сообщения
pub fn correlation_id() -> String {
    generate_v4()
}

/// Временный id оптимистичного сообщения: `<prefix><uuid>`
pub fn temp_message_id(prefix: &str) -> String {
    format!("{}{}", prefix, ::uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_prefixed_and_unique() {
        let a = temp_message_id("local-");
        let b = temp_message_id("local-");
        assert!(a.starts_with("local-"));
        assert_ne!(a, b);
        assert!(::uuid::Uuid::parse_str(&correlation_id()).is_ok());
    }
}
