use honggfuzz::fuzz;
use vendord::{
    chain::Notification,
    codec::{SigningRecord, SigningRequest},
};

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            // Whatever bytes come in, decoding must never panic, and
            // anything that does decode must re-encode to a decodable form.
            if let Ok(record) = SigningRecord::decode(data) {
                let reencoded = record.encode();
                assert_eq!(
                    SigningRecord::decode(&reencoded)
                        .expect("We should always re-decode what we encoded"),
                    record
                );
            }
            let _ = SigningRequest::decode(data);

            // Same for the notification schema, fed from arbitrary JSON.
            if let Ok(states) = serde_json::from_slice::<serde_json::Value>(data) {
                let _ = Notification::from_states(&states);
            }
        });
    }
}
