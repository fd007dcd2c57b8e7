use http_message::HttpError;
use http2_frame::{
    DataFrame, FrameHdr, GoawayFrame, Http2Reader, Http2Visitor, Setting, SettingType, PRI_STR,
};

#[derive(Default)]
struct CountingVisitor {
    frame_begin: usize,
    frame_end: usize,
    goaway: usize,
    data: usize,
    settings_begin: usize,
    settings_end: usize,
    setting: usize,
    headers_begin: usize,
    headers_end: usize,
    header: usize,
    pri_str: usize,
    headers: Vec<(String, Option<String>)>,
    settings: Vec<Setting>,
    body: Vec<u8>,
    errors: Vec<HttpError>,
}

impl Http2Visitor for CountingVisitor {
    fn frame_begin(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        self.frame_begin += 1;
        Ok(())
    }

    fn frame_end(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        self.frame_end += 1;
        Ok(())
    }

    fn data(&mut self, data: &DataFrame<'_>) -> Result<(), HttpError> {
        self.data += 1;
        self.body.extend_from_slice(data.data);
        Ok(())
    }

    fn settings_begin(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        self.settings_begin += 1;
        Ok(())
    }

    fn setting(&mut self, setting: Setting) -> Result<(), HttpError> {
        self.setting += 1;
        self.settings.push(setting);
        Ok(())
    }

    fn settings_end(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        self.settings_end += 1;
        Ok(())
    }

    fn headers_begin(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        self.headers_begin += 1;
        Ok(())
    }

    fn header(&mut self, key: &str, value: Option<&str>) -> Result<(), HttpError> {
        self.header += 1;
        self.headers
            .push((key.to_string(), value.map(|v| v.to_string())));
        Ok(())
    }

    fn headers_end(&mut self, _hdr: &FrameHdr) -> Result<(), HttpError> {
        self.headers_end += 1;
        Ok(())
    }

    fn goaway(&mut self, goaway: &GoawayFrame<'_>) -> Result<(), HttpError> {
        self.goaway += 1;
        assert_eq!(goaway.stream.id, 0);
        assert_eq!(goaway.errcode, 0);
        assert!(goaway.debug_data.is_empty());
        Ok(())
    }

    fn pri_str(&mut self) -> Result<(), HttpError> {
        self.pri_str += 1;
        Ok(())
    }

    fn error(&mut self, err: &HttpError, _msg: &str) {
        self.errors.push(err.clone());
    }
}

const GOAWAY_FRAME: &[u8] = &[
    0x00, 0x00, 0x08, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

const SETTINGS_FRAME: &[u8] = &[
    0x00, 0x00, 0x06, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x64,
];

// HEADERS carrying :method GET, :scheme https, :path /, and a literal
// without indexing whose name is static index 1 (:authority, first
// byte 0x01) with a Huffman-coded value.
const HEADERS_FRAME: &[u8] = &[
    0x00, 0x00, 0x0d, 0x01, 0x05, 0x00, 0x00, 0x00, 0x01, 0x82, 0x87, 0x84, 0x01, 0x88, 0xaa,
    0x69, 0xd2, 0x9a, 0xc4, 0xb9, 0xec, 0x9b,
];

#[test]
fn reads_each_frame_type() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();

    let (len, res) = reader.read(&mut v, GOAWAY_FRAME);
    assert!(res.is_ok());
    assert_eq!(len, GOAWAY_FRAME.len());
    assert_eq!((v.frame_begin, v.frame_end, v.goaway), (1, 1, 1));

    let mut data_frame = vec![0x00, 0x00, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
    data_frame.extend_from_slice(b"hello");
    let (len, res) = reader.read(&mut v, &data_frame);
    assert!(res.is_ok());
    assert_eq!(len, data_frame.len());
    assert_eq!(v.data, 1);
    assert_eq!(v.body, b"hello");

    let (len, res) = reader.read(&mut v, SETTINGS_FRAME);
    assert!(res.is_ok());
    assert_eq!(len, SETTINGS_FRAME.len());
    assert_eq!((v.settings_begin, v.setting, v.settings_end), (1, 1, 1));
    assert_eq!(
        v.settings,
        vec![Setting {
            ty: SettingType::MaxConcurrentStreams,
            value: 100
        }]
    );

    let (len, res) = reader.read(&mut v, HEADERS_FRAME);
    assert!(res.is_ok());
    assert_eq!(len, HEADERS_FRAME.len());
    assert_eq!((v.headers_begin, v.headers_end), (1, 1));

    let (len, res) = reader.read(&mut v, PRI_STR);
    assert!(res.is_ok());
    assert_eq!(len, PRI_STR.len());
    assert_eq!(v.pri_str, 1);

    assert_eq!(v.frame_begin, 4);
    assert_eq!(v.frame_end, 4);
    assert!(v.errors.is_empty());
}

#[test]
fn headers_frame_decodes_in_order() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    let (len, res) = reader.read(&mut v, HEADERS_FRAME);
    assert!(res.is_ok());
    assert_eq!(len, HEADERS_FRAME.len());
    assert_eq!(
        v.headers,
        vec![
            (":method".to_string(), Some("GET".to_string())),
            (":scheme".to_string(), Some("https".to_string())),
            (":path".to_string(), Some("/".to_string())),
            (":authority".to_string(), Some("nghttp2.org".to_string())),
        ]
    );
}

#[test]
fn partial_frame_reports_moredata_without_consuming() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();

    // Header promises 13 bytes; give it the header plus 2.
    let partial = &HEADERS_FRAME[..11];
    let (len, res) = reader.read(&mut v, partial);
    assert_eq!(res, Err(HttpError::MoreData));
    assert_eq!(len, 0);
    assert_eq!(v.frame_begin, 0);
    // MoreData is flow control, not a failure.
    assert!(v.errors.is_empty());

    let (len, res) = reader.read(&mut v, HEADERS_FRAME);
    assert!(res.is_ok());
    assert_eq!(len, HEADERS_FRAME.len());
}

#[test]
fn unknown_frame_type_is_invalid() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    let bad = [0x00, 0x00, 0x00, 0x0b, 0x00, 0x00, 0x00, 0x00, 0x01];
    let (_, res) = reader.read(&mut v, &bad);
    assert_eq!(res, Err(HttpError::InvalidFrameType));
    assert_eq!(v.errors, vec![HttpError::InvalidFrameType]);
}

#[test]
fn misaligned_settings_rejected() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    // Length 7: one full setting plus a stray byte.
    let bad = [
        0x00, 0x00, 0x07, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
        0x64, 0xff,
    ];
    let (_, res) = reader.read(&mut v, &bad);
    assert_eq!(res, Err(HttpError::MisalignedSettings));
}

#[test]
fn unsupported_setting_type_rejected() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    let bad = [
        0x00, 0x00, 0x06, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00,
        0x01,
    ];
    let (_, res) = reader.read(&mut v, &bad);
    assert_eq!(res, Err(HttpError::InvalidSettingType));
}

#[test]
fn dynamic_table_entry_delivers_then_rejects() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    // Literal with incremental indexing, new name: 0x40, then
    // length-prefixed raw strings "k" and "v".
    let payload: &[u8] = &[0x40, 0x01, b'k', 0x01, b'v'];
    let mut frame = vec![0x00, 0x00, payload.len() as u8, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01];
    frame.extend_from_slice(payload);
    let (_, res) = reader.read(&mut v, &frame);
    assert!(matches!(res, Err(HttpError::UnsupportedData(_))));
    // The header itself was still delivered before the rejection.
    assert_eq!(
        v.headers,
        vec![("k".to_string(), Some("v".to_string()))]
    );
}

#[test]
fn zero_size_dynamic_table_update_is_noop() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    // 0x20 = dynamic table size update, size 0, followed by :path /.
    let payload: &[u8] = &[0x20, 0x84];
    let mut frame = vec![0x00, 0x00, payload.len() as u8, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01];
    frame.extend_from_slice(payload);
    let (_, res) = reader.read(&mut v, &frame);
    assert!(res.is_ok());
    assert_eq!(
        v.headers,
        vec![(":path".to_string(), Some("/".to_string()))]
    );
}

#[test]
fn index_zero_is_invalid() {
    let mut reader = Http2Reader::new();
    let mut v = CountingVisitor::default();
    // 0x80: indexed form with index 0.
    let payload: &[u8] = &[0x80];
    let mut frame = vec![0x00, 0x00, 0x01, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01];
    frame.extend_from_slice(payload);
    let (_, res) = reader.read(&mut v, &frame);
    assert_eq!(res, Err(HttpError::InvalidTableIndex));
}
