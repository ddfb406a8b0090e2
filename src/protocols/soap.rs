//! CWMP SOAP codec: envelope rendering, namespace learning, fault table
//!
//! Outgoing envelopes always use the fixed prefixes `soap_env`, `soap_enc`,
//! `xsd`, `xsi` and `cwmp`. Incoming envelopes may bind any prefixes; the
//! codec scans namespace attributes and resolves them before dispatch.

use serde::Deserialize;

use crate::protocols::xml::{DocBuilder, Element};
use crate::{Error, Result};

pub const SOAP_ENV_URL: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_ENC_URL: &str = "http://schemas.xmlsoap.org/soap/encoding/";
pub const XSD_URL: &str = "http://www.w3.org/2001/XMLSchema";
pub const XSI_URL: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// CWMP URNs accepted from the ACS, oldest first.
pub const CWMP_URNS: [&str; 3] = [
    "urn:dslforum-org:cwmp-1-0",
    "urn:dslforum-org:cwmp-1-1",
    "urn:dslforum-org:cwmp-1-2",
];

/// URN bound to the `cwmp` prefix on outgoing envelopes.
pub const CWMP_URN_OUT: &str = "urn:dslforum-org:cwmp-1-2";

/// ACS-side fault code asking the CPE to retry the session later.
pub const FAULT_ACS_8005: &str = "8005";

/// TR-069 fault codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CwmpFault {
    #[default]
    None,
    MethodNotSupported,
    RequestDenied,
    InternalError,
    InvalidArguments,
    ResourcesExceeded,
    InvalidParameterName,
    InvalidParameterType,
    InvalidParameterValue,
    NonWritableParameter,
    NotificationRejected,
    DownloadFailure,
    UploadFailure,
    FileTransferAuthFailure,
    UnsupportedTransferProtocol,
    MulticastJoinFailure,
    FileServerUnreachable,
    FileAccessFailure,
    DownloadIncomplete,
    FileCorrupted,
    FileAuthenticationFailure,
}

impl CwmpFault {
    pub fn code(&self) -> &'static str {
        match self {
            CwmpFault::None => "0",
            CwmpFault::MethodNotSupported => "9000",
            CwmpFault::RequestDenied => "9001",
            CwmpFault::InternalError => "9002",
            CwmpFault::InvalidArguments => "9003",
            CwmpFault::ResourcesExceeded => "9004",
            CwmpFault::InvalidParameterName => "9005",
            CwmpFault::InvalidParameterType => "9006",
            CwmpFault::InvalidParameterValue => "9007",
            CwmpFault::NonWritableParameter => "9008",
            CwmpFault::NotificationRejected => "9009",
            CwmpFault::DownloadFailure => "9010",
            CwmpFault::UploadFailure => "9011",
            CwmpFault::FileTransferAuthFailure => "9012",
            CwmpFault::UnsupportedTransferProtocol => "9013",
            CwmpFault::MulticastJoinFailure => "9014",
            CwmpFault::FileServerUnreachable => "9015",
            CwmpFault::FileAccessFailure => "9016",
            CwmpFault::DownloadIncomplete => "9017",
            CwmpFault::FileCorrupted => "9018",
            CwmpFault::FileAuthenticationFailure => "9019",
        }
    }

    /// SOAP `faultcode` class: faults caused by the caller are `Client`,
    /// everything else is `Server`.
    pub fn class(&self) -> &'static str {
        match self {
            CwmpFault::None => "",
            CwmpFault::InvalidArguments
            | CwmpFault::InvalidParameterName
            | CwmpFault::InvalidParameterType
            | CwmpFault::InvalidParameterValue
            | CwmpFault::NonWritableParameter => "Client",
            _ => "Server",
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            CwmpFault::None => "",
            CwmpFault::MethodNotSupported => "Method not supported",
            CwmpFault::RequestDenied => "Request denied",
            CwmpFault::InternalError => "Internal error",
            CwmpFault::InvalidArguments => "Invalid arguments",
            CwmpFault::ResourcesExceeded => "Resources exceeded",
            CwmpFault::InvalidParameterName => "Invalid parameter name",
            CwmpFault::InvalidParameterType => "Invalid parameter type",
            CwmpFault::InvalidParameterValue => "Invalid parameter value",
            CwmpFault::NonWritableParameter => "Attempt to set a non-writable parameter",
            CwmpFault::NotificationRejected => "Notification request rejected",
            CwmpFault::DownloadFailure => "Download failure",
            CwmpFault::UploadFailure => "Upload failure",
            CwmpFault::FileTransferAuthFailure => "File transfer server authentication failure",
            CwmpFault::UnsupportedTransferProtocol => "Unsupported protocol for file transfer",
            CwmpFault::MulticastJoinFailure => "Download failure: unable to join multicast group",
            CwmpFault::FileServerUnreachable => "Download failure: unable to contact file server",
            CwmpFault::FileAccessFailure => "Download failure: unable to access file",
            CwmpFault::DownloadIncomplete => "Download failure: unable to complete download",
            CwmpFault::FileCorrupted => "Download failure: file corrupted",
            CwmpFault::FileAuthenticationFailure => "Download failure: file authentication failure",
        }
    }

    /// Map a textual fault code back onto the table. Unknown codes collapse
    /// to 9002 the way the original table lookup did.
    pub fn from_code(code: &str) -> CwmpFault {
        match code {
            "0" => CwmpFault::None,
            "9000" => CwmpFault::MethodNotSupported,
            "9001" => CwmpFault::RequestDenied,
            "9002" => CwmpFault::InternalError,
            "9003" => CwmpFault::InvalidArguments,
            "9004" => CwmpFault::ResourcesExceeded,
            "9005" => CwmpFault::InvalidParameterName,
            "9006" => CwmpFault::InvalidParameterType,
            "9007" => CwmpFault::InvalidParameterValue,
            "9008" => CwmpFault::NonWritableParameter,
            "9009" => CwmpFault::NotificationRejected,
            "9010" => CwmpFault::DownloadFailure,
            "9011" => CwmpFault::UploadFailure,
            "9012" => CwmpFault::FileTransferAuthFailure,
            "9013" => CwmpFault::UnsupportedTransferProtocol,
            "9014" => CwmpFault::MulticastJoinFailure,
            "9015" => CwmpFault::FileServerUnreachable,
            "9016" => CwmpFault::FileAccessFailure,
            "9017" => CwmpFault::DownloadIncomplete,
            "9018" => CwmpFault::FileCorrupted,
            "9019" => CwmpFault::FileAuthenticationFailure,
            _ => CwmpFault::InternalError,
        }
    }
}

/// Device identity reported in every Inform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceId {
    pub manufacturer: String,
    pub oui: String,
    pub product_class: String,
    pub serial_number: String,
}

/// Event entry for the Inform body.
#[derive(Debug, Clone)]
pub struct EventStruct {
    pub event_code: String,
    pub command_key: String,
}

/// Typed parameter value; `xsi_type` is carried verbatim from the data-model
/// provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
    pub xsi_type: String,
}

/// Namespace prefixes learned from an incoming ACS envelope.
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    pub soap_env: Vec<String>,
    pub soap_enc: Option<String>,
    pub xsd: Option<String>,
    pub xsi: Option<String>,
    pub cwmp: Option<String>,
    /// Which of the accepted CWMP URNs the ACS bound.
    pub cwmp_urn: Option<String>,
}

impl Namespaces {
    /// Scan every namespace attribute in the document and record which local
    /// prefixes map to the well-known URLs. Fails unless both a SOAP
    /// envelope prefix and a CWMP prefix were found.
    pub fn learn(root: &Element) -> Result<Namespaces> {
        let mut ns = Namespaces::default();
        scan_element(root, &mut ns);
        if ns.soap_env.is_empty() || ns.cwmp.is_none() {
            return Err(Error::protocol("missing soap or cwmp namespace declaration"));
        }
        Ok(ns)
    }

    /// True when `name` is `<env-prefix>:<local>` for any learned envelope
    /// prefix.
    pub fn is_env(&self, name: &str, local: &str) -> bool {
        match name.split_once(':') {
            Some((prefix, rest)) => rest == local && self.soap_env.iter().any(|p| p == prefix),
            None => false,
        }
    }

    pub fn is_cwmp(&self, name: &str, local: &str) -> bool {
        match (name.split_once(':'), &self.cwmp) {
            (Some((prefix, rest)), Some(cwmp)) => rest == local && prefix == cwmp,
            _ => false,
        }
    }
}

fn scan_element(elem: &Element, ns: &mut Namespaces) {
    for (key, value) in &elem.attributes {
        let prefix = match key.strip_prefix("xmlns:") {
            Some(p) => p,
            None => continue,
        };
        if value == SOAP_ENV_URL && !ns.soap_env.iter().any(|p| p == prefix) {
            ns.soap_env.push(prefix.to_string());
        } else if value == SOAP_ENC_URL && ns.soap_enc.is_none() {
            ns.soap_enc = Some(prefix.to_string());
        } else if value == XSD_URL && ns.xsd.is_none() {
            ns.xsd = Some(prefix.to_string());
        } else if value == XSI_URL && ns.xsi.is_none() {
            ns.xsi = Some(prefix.to_string());
        } else if ns.cwmp.is_none() && CWMP_URNS.contains(&value.as_str()) {
            ns.cwmp = Some(prefix.to_string());
            ns.cwmp_urn = Some(value.clone());
        }
    }
    for child in &elem.children {
        scan_element(child, ns);
    }
}

fn envelope_open(b: &mut DocBuilder, id: &str) {
    b.open_attrs(
        "soap_env:Envelope",
        &[
            ("xmlns:soap_env", SOAP_ENV_URL),
            ("xmlns:soap_enc", SOAP_ENC_URL),
            ("xmlns:xsd", XSD_URL),
            ("xmlns:xsi", XSI_URL),
            ("xmlns:cwmp", CWMP_URN_OUT),
        ],
    );
    b.open("soap_env:Header");
    b.leaf_attrs("cwmp:ID", &[("soap_env:mustUnderstand", "1")], id);
    b.close("soap_env:Header");
    b.open("soap_env:Body");
}

fn envelope_close(b: &mut DocBuilder) {
    b.close("soap_env:Body");
    b.close("soap_env:Envelope");
}

/// Render a CPE response envelope. When the ACS sent a `cwmp:ID` it is
/// echoed byte for byte; body content comes from the callback.
pub fn render_cpe_message<F>(id: &str, body: F) -> String
where
    F: FnOnce(&mut DocBuilder),
{
    let mut b = DocBuilder::new();
    envelope_open(&mut b, id);
    body(&mut b);
    envelope_close(&mut b);
    b.finish()
}

/// Render the Inform request. Parameters come first, then pending
/// notifications deduplicated against paths already present.
pub fn render_inform(
    id: &str,
    device_id: &DeviceId,
    events: &[EventStruct],
    parameters: &[ParameterValue],
    notifications: &[ParameterValue],
    current_time: &str,
    retry_count: u32,
) -> String {
    let mut listed: Vec<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
    let mut body: Vec<&ParameterValue> = parameters.iter().collect();
    for n in notifications {
        if listed.contains(&n.name.as_str()) {
            continue;
        }
        listed.push(&n.name);
        body.push(n);
    }

    render_cpe_message(id, |b| {
        b.open("cwmp:Inform");

        b.open("DeviceId");
        b.leaf("Manufacturer", &device_id.manufacturer);
        b.leaf("OUI", &device_id.oui);
        b.leaf("ProductClass", &device_id.product_class);
        b.leaf("SerialNumber", &device_id.serial_number);
        b.close("DeviceId");

        let array_type = format!("cwmp:EventStruct[{}]", events.len());
        b.open_attrs("Event", &[("soap_enc:arrayType", &array_type)]);
        for event in events {
            b.open("EventStruct");
            b.leaf("EventCode", &event.event_code);
            b.leaf("CommandKey", &event.command_key);
            b.close("EventStruct");
        }
        b.close("Event");

        b.leaf("MaxEnvelopes", "1");
        b.leaf("CurrentTime", current_time);
        b.leaf("RetryCount", &retry_count.to_string());

        let array_type = format!("cwmp:ParameterValueStruct[{}]", body.len());
        b.open_attrs("ParameterList", &[("soap_enc:arrayType", &array_type)]);
        for p in &body {
            b.open("ParameterValueStruct");
            b.leaf("Name", &p.name);
            b.leaf_attrs("Value", &[("xsi:type", &p.xsi_type)], &p.value);
            b.close("ParameterValueStruct");
        }
        b.close("ParameterList");

        b.close("cwmp:Inform");
    })
}

/// Render the CPE-initiated GetRPCMethods request.
pub fn render_get_rpc_methods(id: &str) -> String {
    render_cpe_message(id, |b| {
        b.open("cwmp:GetRPCMethods");
        b.close("cwmp:GetRPCMethods");
    })
}

/// Render a TransferComplete request from a persisted transfer record.
pub fn render_transfer_complete(
    id: &str,
    command_key: &str,
    fault_code: &str,
    fault_string: &str,
    start_time: &str,
    complete_time: &str,
) -> String {
    render_cpe_message(id, |b| {
        b.open("cwmp:TransferComplete");
        b.leaf("CommandKey", command_key);
        b.open("FaultStruct");
        b.leaf("FaultCode", fault_code);
        b.leaf("FaultString", fault_string);
        b.close("FaultStruct");
        b.leaf("StartTime", start_time);
        b.leaf("CompleteTime", complete_time);
        b.close("cwmp:TransferComplete");
    })
}

/// Append a generic CWMP fault to a response body.
pub fn build_fault(b: &mut DocBuilder, fault: CwmpFault) {
    b.open("soap_env:Fault");
    b.leaf("faultcode", fault.class());
    b.leaf("faultstring", "CWMP fault");
    b.open("detail");
    b.open("cwmp:Fault");
    b.leaf("FaultCode", fault.code());
    b.leaf("FaultString", fault.text());
    b.close("cwmp:Fault");
    b.close("detail");
    b.close("soap_env:Fault");
}

/// A parsed ACS request: the echoed ID, learned namespaces and the first
/// element inside the Body.
#[derive(Debug)]
pub struct AcsRequest<'a> {
    pub id: Option<String>,
    pub ns: Namespaces,
    pub method: String,
    pub body: &'a Element,
}

/// Parse an ACS request envelope. `Err(fault)` carries the fault code the
/// reply must use.
pub fn parse_acs_request(root: &Element) -> std::result::Result<AcsRequest<'_>, CwmpFault> {
    let ns = match Namespaces::learn(root) {
        Ok(ns) => ns,
        Err(_) => return Err(CwmpFault::InvalidArguments),
    };

    // The ACS may omit cwmp:ID; the response then carries a minted one.
    let id = find_by_ns(root, &ns, NsMatch::Cwmp, "ID").map(|e| e.text.clone());

    let body = match find_by_ns(root, &ns, NsMatch::Env, "Body") {
        Some(body) => body,
        None => return Err(CwmpFault::InvalidArguments),
    };
    let request = match body.first_element_child() {
        Some(elem) => elem,
        None => return Err(CwmpFault::InvalidArguments),
    };

    // The method element must live in the CWMP namespace.
    let method = match request.name.split_once(':') {
        Some((prefix, local)) if Some(prefix) == ns.cwmp.as_deref() => local.to_string(),
        _ => return Err(CwmpFault::InvalidArguments),
    };

    Ok(AcsRequest {
        id,
        ns,
        method,
        body: request,
    })
}

#[derive(Clone, Copy)]
enum NsMatch {
    Env,
    Cwmp,
}

fn find_by_ns<'a>(
    elem: &'a Element,
    ns: &Namespaces,
    which: NsMatch,
    local: &str,
) -> Option<&'a Element> {
    let matches = match which {
        NsMatch::Env => ns.is_env(&elem.name, local),
        NsMatch::Cwmp => ns.is_cwmp(&elem.name, local),
    };
    if matches {
        return Some(elem);
    }
    elem.children
        .iter()
        .find_map(|c| find_by_ns(c, ns, which, local))
}

/// Outcome of parsing a response to a CPE-initiated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcsReply {
    Ok { hold_requests: bool },
    Retry8005,
}

fn fault_is_8005(root: &Element, ns: &Namespaces) -> Option<bool> {
    let fault = find_by_ns(root, ns, NsMatch::Env, "Fault")?;
    let mut texts = Vec::new();
    collect_texts(fault, &mut texts);
    Some(texts.iter().any(|t| t.trim() == FAULT_ACS_8005))
}

fn collect_texts<'a>(elem: &'a Element, out: &mut Vec<&'a str>) {
    if !elem.text.is_empty() {
        out.push(&elem.text);
    }
    for child in &elem.children {
        collect_texts(child, out);
    }
}

fn hold_requests(root: &Element, ns: &Namespaces) -> bool {
    let mut hold = false;
    for local in ["NoMoreRequests", "HoldRequests"] {
        if let Some(elem) = find_by_ns(root, ns, NsMatch::Cwmp, local) {
            hold = elem.trimmed_text().parse::<i32>().map(|v| v != 0).unwrap_or(false);
        }
    }
    hold
}

/// Parse the InformResponse. A missing MaxEnvelopes or a non-8005 fault is
/// a protocol error and fails the session.
pub fn parse_inform_response(xml: &str) -> Result<AcsReply> {
    let root = Element::parse(xml)?;
    let ns = Namespaces::learn(&root)?;

    match fault_is_8005(&root, &ns) {
        Some(true) => return Ok(AcsReply::Retry8005),
        Some(false) => return Err(Error::protocol("ACS answered Inform with a fault")),
        None => {}
    }

    let hold = hold_requests(&root, &ns);

    let max_envelopes = root
        .find_local("MaxEnvelopes")
        .ok_or_else(|| Error::protocol("InformResponse without MaxEnvelopes"))?;
    if max_envelopes.trimmed_text().is_empty() {
        return Err(Error::protocol("InformResponse with empty MaxEnvelopes"));
    }

    Ok(AcsReply::Ok { hold_requests: hold })
}

/// Parse the response to GetRPCMethods or TransferComplete. Only an 8005
/// fault asks for a retry; any other fault is accepted as delivered.
pub fn parse_rpc_response(xml: &str) -> Result<AcsReply> {
    let root = Element::parse(xml)?;
    let ns = Namespaces::learn(&root)?;

    if let Some(true) = fault_is_8005(&root, &ns) {
        return Ok(AcsReply::Retry8005);
    }

    let hold = hold_requests(&root, &ns);
    Ok(AcsReply::Ok { hold_requests: hold })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId {
            manufacturer: "Redfire".to_string(),
            oui: "ABC123".to_string(),
            product_class: "CPE".to_string(),
            serial_number: "SN0001".to_string(),
        }
    }

    #[test]
    fn inform_lists_events_and_array_sizes() {
        let events = vec![EventStruct {
            event_code: "1 BOOT".to_string(),
            command_key: String::new(),
        }];
        let params = vec![ParameterValue {
            name: "Device.DeviceInfo.SoftwareVersion".to_string(),
            value: "1.0".to_string(),
            xsi_type: "xsd:string".to_string(),
        }];
        let xml = render_inform("1", &device(), &events, &params, &[], "2026-01-01T00:00:00Z", 0);

        let root = Element::parse(&xml).unwrap();
        let event = root.find_local("Event").unwrap();
        assert_eq!(event.attr("soap_enc:arrayType"), Some("cwmp:EventStruct[1]"));
        assert_eq!(
            event.find_local("EventCode").unwrap().text,
            "1 BOOT"
        );
        let list = root.find_local("ParameterList").unwrap();
        assert_eq!(
            list.attr("soap_enc:arrayType"),
            Some("cwmp:ParameterValueStruct[1]")
        );
        assert_eq!(root.find_local("RetryCount").unwrap().text, "0");
        assert_eq!(root.find_local("MaxEnvelopes").unwrap().text, "1");
    }

    #[test]
    fn inform_deduplicates_notifications_against_parameters() {
        let params = vec![ParameterValue {
            name: "Device.X".to_string(),
            value: "a".to_string(),
            xsi_type: "xsd:string".to_string(),
        }];
        let notifications = vec![
            ParameterValue {
                name: "Device.X".to_string(),
                value: "stale".to_string(),
                xsi_type: "xsd:string".to_string(),
            },
            ParameterValue {
                name: "Device.Y".to_string(),
                value: "b".to_string(),
                xsi_type: "xsd:string".to_string(),
            },
        ];
        let xml = render_inform("7", &device(), &[], &params, &notifications, "t", 0);
        let root = Element::parse(&xml).unwrap();
        let list = root.find_local("ParameterList").unwrap();
        assert_eq!(list.children.len(), 2);
        assert_eq!(
            list.attr("soap_enc:arrayType"),
            Some("cwmp:ParameterValueStruct[2]")
        );
    }

    #[test]
    fn inform_is_deterministic() {
        let events = vec![EventStruct {
            event_code: "2 PERIODIC".to_string(),
            command_key: String::new(),
        }];
        let a = render_inform("3", &device(), &events, &[], &[], "2026-01-01T00:00:00Z", 2);
        let b = render_inform("3", &device(), &events, &[], &[], "2026-01-01T00:00:00Z", 2);
        assert_eq!(a, b);
    }

    #[test]
    fn learns_arbitrary_prefixes() {
        let xml = format!(
            "<e:Envelope xmlns:e=\"{}\" xmlns:c=\"{}\"><e:Header><c:ID>77</c:ID></e:Header><e:Body><c:Reboot><CommandKey>k</CommandKey></c:Reboot></e:Body></e:Envelope>",
            SOAP_ENV_URL, CWMP_URNS[0]
        );
        let root = Element::parse(&xml).unwrap();
        let req = parse_acs_request(&root).unwrap();
        assert_eq!(req.id.as_deref(), Some("77"));
        assert_eq!(req.method, "Reboot");
        assert_eq!(req.ns.cwmp_urn.as_deref(), Some(CWMP_URNS[0]));
    }

    #[test]
    fn rejects_method_outside_cwmp_namespace() {
        let xml = format!(
            "<e:Envelope xmlns:e=\"{}\" xmlns:c=\"{}\"><e:Body><other:Reboot/></e:Body></e:Envelope>",
            SOAP_ENV_URL, CWMP_URNS[2]
        );
        let root = Element::parse(&xml).unwrap();
        assert_eq!(
            parse_acs_request(&root).unwrap_err(),
            CwmpFault::InvalidArguments
        );
    }

    #[test]
    fn rejects_envelope_without_namespaces() {
        let root = Element::parse("<Envelope><Body><Reboot/></Body></Envelope>").unwrap();
        assert_eq!(
            parse_acs_request(&root).unwrap_err(),
            CwmpFault::InvalidArguments
        );
    }

    #[test]
    fn inform_response_reads_hold_requests() {
        let xml = format!(
            "<e:Envelope xmlns:e=\"{}\" xmlns:c=\"{}\"><e:Header><c:HoldRequests>1</c:HoldRequests></e:Header><e:Body><c:InformResponse><MaxEnvelopes>1</MaxEnvelopes></c:InformResponse></e:Body></e:Envelope>",
            SOAP_ENV_URL, CWMP_URNS[2]
        );
        assert_eq!(
            parse_inform_response(&xml).unwrap(),
            AcsReply::Ok { hold_requests: true }
        );
    }

    #[test]
    fn inform_response_without_max_envelopes_is_an_error() {
        let xml = format!(
            "<e:Envelope xmlns:e=\"{}\" xmlns:c=\"{}\"><e:Body><c:InformResponse/></e:Body></e:Envelope>",
            SOAP_ENV_URL, CWMP_URNS[2]
        );
        assert!(parse_inform_response(&xml).is_err());
    }

    #[test]
    fn fault_8005_requests_retry() {
        let xml = format!(
            "<e:Envelope xmlns:e=\"{}\" xmlns:c=\"{}\"><e:Body><e:Fault><detail><c:Fault><FaultCode>8005</FaultCode></c:Fault></detail></e:Fault></e:Body></e:Envelope>",
            SOAP_ENV_URL, CWMP_URNS[2]
        );
        assert_eq!(parse_inform_response(&xml).unwrap(), AcsReply::Retry8005);
        assert_eq!(parse_rpc_response(&xml).unwrap(), AcsReply::Retry8005);
    }

    #[test]
    fn non_8005_fault_on_transfer_complete_counts_as_delivered() {
        let xml = format!(
            "<e:Envelope xmlns:e=\"{}\" xmlns:c=\"{}\"><e:Body><e:Fault><detail><c:Fault><FaultCode>9002</FaultCode></c:Fault></detail></e:Fault></e:Body></e:Envelope>",
            SOAP_ENV_URL, CWMP_URNS[2]
        );
        assert_eq!(
            parse_rpc_response(&xml).unwrap(),
            AcsReply::Ok { hold_requests: false }
        );
    }

    #[test]
    fn transfer_complete_carries_record_fields() {
        let xml = render_transfer_complete(
            "5",
            "fw1",
            "0",
            "",
            "2026-01-01T00:00:00Z",
            "2026-01-01T00:05:00Z",
        );
        let root = Element::parse(&xml).unwrap();
        assert_eq!(root.find_local("CommandKey").unwrap().text, "fw1");
        assert_eq!(root.find_local("FaultCode").unwrap().text, "0");
        assert_eq!(
            root.find_local("CompleteTime").unwrap().text,
            "2026-01-01T00:05:00Z"
        );
    }

    #[test]
    fn fault_table_maps_codes_both_ways() {
        assert_eq!(CwmpFault::InvalidArguments.code(), "9003");
        assert_eq!(CwmpFault::InvalidArguments.class(), "Client");
        assert_eq!(CwmpFault::ResourcesExceeded.class(), "Server");
        assert_eq!(CwmpFault::from_code("9015"), CwmpFault::FileServerUnreachable);
        assert_eq!(CwmpFault::from_code("bogus"), CwmpFault::InternalError);
    }
}
