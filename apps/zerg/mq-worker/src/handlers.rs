//! Demo message types served by the worker

use mq_server::{HandlerError, Message, MqMessage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseRequest {
    pub value: String,
}

impl MqMessage for ReverseRequest {
    const TYPE_NAME: &'static str = "Reverse";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseResponse {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

impl MqMessage for Hello {
    const TYPE_NAME: &'static str = "Hello";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub result: String,
}

pub fn reverse(msg: &Message<ReverseRequest>) -> Result<Option<ReverseResponse>, HandlerError> {
    Ok(Some(ReverseResponse {
        value: msg.body.value.chars().rev().collect(),
    }))
}

/// Greets by name; an empty name is dead-lettered without retries
pub fn hello(msg: &Message<Hello>) -> Result<Option<HelloResponse>, HandlerError> {
    let name = msg.body.name.trim();
    if name.is_empty() {
        return Err(HandlerError::unretryable("name is required"));
    }

    Ok(Some(HelloResponse {
        result: format!("Hello, {}!", name),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse() {
        let msg = Message::new(ReverseRequest {
            value: "Hello".into(),
        });
        let response = reverse(&msg).unwrap().unwrap();
        assert_eq!(response.value, "olleH");
    }

    #[test]
    fn test_hello() {
        let msg = Message::new(Hello {
            name: " World ".into(),
        });
        let response = hello(&msg).unwrap().unwrap();
        assert_eq!(response.result, "Hello, World!");
    }

    #[test]
    fn test_hello_rejects_empty_name() {
        let msg = Message::new(Hello { name: "  ".into() });
        let err = hello(&msg).unwrap_err();
        assert!(!err.retryable);
    }
}
