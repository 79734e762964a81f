//! 实例编解码测试

use zk_discovery::{
    DiscoveryError, ErrorCode, InstanceSerializer, JsonInstanceSerializer, ServiceInstance,
    ServiceType,
};

fn minimal_instance() -> ServiceInstance {
    ServiceInstance {
        name: "0".to_string(),
        id: "a".to_string(),
        address: "addr1".to_string(),
        port: Some(80),
        ssl_port: None,
        payload: None,
        registration_time_utc: 3,
        service_type: ServiceType::Dynamic,
        uri_spec: None,
    }
}

#[test]
fn test_wire_format_is_fixed() {
    let bytes = JsonInstanceSerializer.serialize(&minimal_instance()).unwrap();
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        r#"{"name":"0","id":"a","address":"addr1","port":80,"sslPort":null,"payload":null,"registrationTimeUTC":3,"serviceType":"DYNAMIC","uriSpec":null}"#
    );
}

#[test]
fn test_round_trip_with_optional_fields_absent() {
    let serializer = JsonInstanceSerializer;
    let mut instance = minimal_instance();
    instance.port = None;

    let bytes = serializer.serialize(&instance).unwrap();
    let decoded = serializer.deserialize(&bytes).unwrap();
    assert_eq!(decoded, instance);
}

#[test]
fn test_round_trip_with_all_fields_present() {
    let serializer = JsonInstanceSerializer;
    let mut instance = ServiceInstance::new_simple("payments", "10.0.0.7", 8080)
        .with_ssl_port(8443)
        .with_payload(r#"{"zone":"b"}"#)
        .with_service_type(ServiceType::Permanent);
    instance.uri_spec = Some("{scheme}://{address}:{port}".to_string());

    let bytes = serializer.serialize(&instance).unwrap();
    let decoded = serializer.deserialize(&bytes).unwrap();
    assert_eq!(decoded, instance);
}

#[test]
fn test_service_type_encoded_by_name() {
    let serializer = JsonInstanceSerializer;
    let instance = minimal_instance().with_service_type(ServiceType::Static);
    let text = String::from_utf8(serializer.serialize(&instance).unwrap()).unwrap();
    assert!(text.contains(r#""serviceType":"STATIC""#));
}

#[test]
fn test_unknown_fields_are_ignored() {
    let text = r#"{"name":"svc","id":"x","address":"h","port":null,"sslPort":null,"payload":null,"registrationTimeUTC":1,"serviceType":"DYNAMIC","uriSpec":null,"weight":5}"#;
    let decoded = JsonInstanceSerializer.deserialize(text.as_bytes()).unwrap();
    assert_eq!(decoded.id, "x");
    assert_eq!(decoded.port, None);
}

#[test]
fn test_malformed_bytes_fail_to_decode() {
    let err = JsonInstanceSerializer.deserialize(b"not json").unwrap_err();
    assert!(matches!(err, DiscoveryError::Deserialization(_)));
    assert_eq!(err.code(), ErrorCode::DeserializationError);
    assert!(!err.is_retryable());
}

#[test]
fn test_missing_required_field_fails_to_decode() {
    let text = r#"{"name":"svc","id":"x","port":80}"#;
    assert!(JsonInstanceSerializer.deserialize(text.as_bytes()).is_err());
}

#[test]
fn test_unknown_service_type_fails_to_decode() {
    let text = r#"{"name":"svc","id":"x","address":"h","port":null,"sslPort":null,"payload":null,"registrationTimeUTC":1,"serviceType":"TRANSIENT","uriSpec":null}"#;
    assert!(JsonInstanceSerializer.deserialize(text.as_bytes()).is_err());
}

#[test]
fn test_new_instance_defaults() {
    let a = ServiceInstance::new_simple("svc", "host", 9000);
    let b = ServiceInstance::new_simple("svc", "host", 9000);

    assert_ne!(a.id, b.id);
    assert_eq!(a.service_type, ServiceType::Dynamic);
    assert!(a.is_ephemeral());
    assert!(a.registration_time_utc > 0);
    assert_eq!(a.spec(), "host:9000");

    let no_port = ServiceInstance::new("svc", "host", None, None, None);
    assert_eq!(no_port.spec(), "host");
}

#[test]
fn test_out_of_range_port_fails_to_decode() {
    for port in ["70000", "-1"] {
        let text = format!(
            r#"{{"name":"svc","id":"x","address":"h","port":{},"sslPort":null,"payload":null,"registrationTimeUTC":1,"serviceType":"DYNAMIC","uriSpec":null}}"#,
            port
        );
        let err = JsonInstanceSerializer.deserialize(text.as_bytes()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Deserialization(_)), "port {}", port);
    }
}
