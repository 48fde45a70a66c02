// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Recipient-encrypted KMS responses arrive as ASN.1 enveloped-data: exactly
//! one key-transport recipient wrapping a fresh AES-256 content key to our
//! RSA-OAEP-SHA256 public key, and an AES-256-CBC payload whose IV rides in
//! the algorithm parameters.
//!
//! Parsing and structural validation happen up front in
//! [`RecipientEnvelope::parse`]; [`RecipientEnvelope::open`] performs the two
//! decryption steps. Decryption failures carry no detail, so nothing derived
//! from key material can leak through an error path.

use asn1_rs::{oid, Any, BerSequence, Class, FromBer, Integer, OctetString, Oid, OptTaggedParser, SetOf, Tag, Tagged};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;

use caisson_common::Error;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const OID_ENVELOPED_DATA: Oid<'static> = oid!(1.2.840 .113549 .1 .7 .3);
const OID_DATA: Oid<'static> = oid!(1.2.840 .113549 .1 .7 .1);
const OID_RSAES_OAEP: Oid<'static> = oid!(1.2.840 .113549 .1 .1 .7);
const OID_MGF1: Oid<'static> = oid!(1.2.840 .113549 .1 .1 .8);
const OID_SHA256: Oid<'static> = oid!(2.16.840 .1 .101 .3 .4 .2 .1);
const OID_AES256_CBC: Oid<'static> = oid!(2.16.840 .1 .101 .3 .4 .1 .42);

const AES256_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

/// The pieces of a validated envelope needed to recover the payload.
pub struct RecipientEnvelope {
    wrapped_key: Vec<u8>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl RecipientEnvelope {
    /// Parses BER bytes and checks every structural expectation: content
    /// types, versions, a single recipient, and the exact algorithm suite.
    pub fn parse(ber: &[u8]) -> Result<Self, Error> {
        let (rest, outer) = RawContentInfo::from_ber(ber)
            .map_err(|err| decode_err(format!("envelope does not parse: {err}")))?;

        if !rest.is_empty() {
            return Err(decode_err(format!(
                "{} trailing bytes after the envelope",
                rest.len()
            )));
        }

        if outer.content_type != OID_ENVELOPED_DATA {
            return Err(decode_err(format!(
                "content type {} is not enveloped-data",
                outer.content_type
            )));
        }

        let enveloped = outer.content;

        let version = enveloped
            .version
            .as_i32()
            .map_err(|err| decode_err(format!("bad envelope version: {err}")))?;
        if version != 2 {
            return Err(decode_err(format!("envelope version {version}, expected 2")));
        }

        if enveloped.recipients.len() != 1 {
            return Err(decode_err(format!(
                "{} recipients, expected exactly 1",
                enveloped.recipients.len()
            )));
        }
        let recipient = enveloped.recipients.iter().next().unwrap();
        check_recipient(recipient)?;

        let content = &enveloped.content;
        if content.content_type != OID_DATA {
            return Err(decode_err(format!(
                "encrypted content type {} is not data",
                content.content_type
            )));
        }
        if content.algorithm.oid != OID_AES256_CBC {
            return Err(decode_err(format!(
                "content algorithm {} is not AES-256-CBC",
                content.algorithm.oid
            )));
        }

        let iv = content_iv(&content.algorithm)?;
        let ciphertext = gather_content(&content.data)?;

        Ok(Self {
            wrapped_key: recipient.wrapped_key.as_ref().to_vec(),
            iv,
            ciphertext,
        })
    }

    /// Unwraps the content key with the recipient private key, then decrypts
    /// the payload and strips its padding.
    pub fn open(&self, private_key: &RsaPrivateKey) -> Result<Vec<u8>, Error> {
        let content_key = private_key
            .decrypt(Oaep::new::<Sha256>(), &self.wrapped_key)
            .map_err(|_| Error::Decrypt)?;

        if content_key.len() != AES256_KEY_LEN {
            return Err(Error::Decrypt);
        }

        Aes256CbcDec::new(content_key.as_slice().into(), self.iv.as_slice().into())
            .decrypt_padded_vec_mut::<Pkcs7>(&self.ciphertext)
            .map_err(|_| Error::Decrypt)
    }
}

fn decode_err(msg: String) -> Error {
    Error::EnvelopeDecode(msg)
}

/*
ContentInfo ::= SEQUENCE {
  contentType ContentType,
  content [0] EXPLICIT ANY DEFINED BY contentType }
*/
#[derive(BerSequence, Debug)]
struct RawContentInfo<'a> {
    content_type: Oid<'a>,

    #[tag_explicit(0)]
    content: RawEnvelopedData<'a>,
}

/*
EnvelopedData ::= SEQUENCE {
  version CMSVersion,
  originatorInfo [0] IMPLICIT OriginatorInfo OPTIONAL,
  recipientInfos SET SIZE (1..MAX) OF RecipientInfo,
  encryptedContentInfo EncryptedContentInfo,
  unprotectedAttrs [1] IMPLICIT UnprotectedAttributes OPTIONAL }
*/
#[derive(BerSequence, Debug)]
struct RawEnvelopedData<'a> {
    version: Integer<'a>,

    #[optional]
    #[tag_implicit(0)]
    originator: Option<RawOriginator<'a>>,

    recipients: SetOf<RawRecipient<'a>>,

    content: RawEncryptedContent<'a>,

    #[optional]
    #[tag_implicit(1)]
    unprotected: Option<SetOf<Any<'a>>>,
}

#[derive(BerSequence, Debug)]
struct RawOriginator<'a> {
    #[optional]
    #[tag_implicit(0)]
    certs: Option<SetOf<Any<'a>>>,

    #[optional]
    #[tag_implicit(1)]
    crls: Option<SetOf<Any<'a>>>,
}

/*
KeyTransRecipientInfo ::= SEQUENCE {
  version CMSVersion,
  rid RecipientIdentifier,
  keyEncryptionAlgorithm KeyEncryptionAlgorithmIdentifier,
  encryptedKey OCTET STRING }
*/
#[derive(BerSequence, Debug)]
struct RawRecipient<'a> {
    version: Integer<'a>,
    rid: Any<'a>,
    key_algorithm: RawAlgorithm<'a>,
    wrapped_key: OctetString<'a>,
}

#[derive(BerSequence, Debug)]
struct RawAlgorithm<'a> {
    oid: Oid<'a>,

    #[optional]
    params: Option<Any<'a>>,
}

/*
EncryptedContentInfo ::= SEQUENCE {
  contentType ContentType,
  contentEncryptionAlgorithm ContentEncryptionAlgorithmIdentifier,
  encryptedContent [0] IMPLICIT EncryptedContent OPTIONAL }
*/
#[derive(BerSequence, Debug)]
struct RawEncryptedContent<'a> {
    content_type: Oid<'a>,
    algorithm: RawAlgorithm<'a>,
    data: Any<'a>,
}

fn check_recipient(recipient: &RawRecipient<'_>) -> Result<(), Error> {
    let version = recipient
        .version
        .as_i32()
        .map_err(|err| decode_err(format!("bad recipient version: {err}")))?;
    if version != 2 {
        return Err(decode_err(format!("recipient version {version}, expected 2")));
    }

    if recipient.key_algorithm.oid != OID_RSAES_OAEP {
        return Err(decode_err(format!(
            "key transport algorithm {} is not RSAES-OAEP",
            recipient.key_algorithm.oid
        )));
    }

    let params = recipient
        .key_algorithm
        .params
        .as_ref()
        .ok_or_else(|| decode_err("RSAES-OAEP parameters are missing".to_string()))?;

    check_oaep_params(params)
}

/*
RSAES-OAEP-params ::= SEQUENCE {
  hashFunc    [0] AlgorithmIdentifier DEFAULT sha1,
  maskGenFunc [1] AlgorithmIdentifier DEFAULT mgf1SHA1,
  pSourceFunc [2] AlgorithmIdentifier DEFAULT pSpecifiedEmpty }
*/
fn check_oaep_params(params: &Any<'_>) -> Result<(), Error> {
    params
        .tag()
        .assert_eq(Tag::Sequence)
        .map_err(|err| decode_err(format!("OAEP parameters are not a sequence: {err}")))?;

    let data = params.data;

    let (data, hash) = OptTaggedParser::new(Class::ContextSpecific, Tag(0))
        .parse_ber(data, |_, inner| RawAlgorithm::from_ber(inner))
        .map_err(|err| decode_err(format!("bad OAEP hash function: {err}")))?;

    match hash {
        Some(alg) if alg.oid == OID_SHA256 => {}
        Some(alg) => {
            return Err(decode_err(format!("OAEP hash {} is not SHA-256", alg.oid)));
        }
        // The SHA-1 default is not acceptable here.
        None => return Err(decode_err("OAEP hash function is missing".to_string())),
    }

    let (_, mask_gen) = OptTaggedParser::new(Class::ContextSpecific, Tag(1))
        .parse_ber(data, |_, inner| RawAlgorithm::from_ber(inner))
        .map_err(|err| decode_err(format!("bad OAEP mask function: {err}")))?;

    let mask_gen =
        mask_gen.ok_or_else(|| decode_err("OAEP mask function is missing".to_string()))?;
    if mask_gen.oid != OID_MGF1 {
        return Err(decode_err(format!(
            "OAEP mask function {} is not MGF1",
            mask_gen.oid
        )));
    }

    let mgf_params = mask_gen
        .params
        .ok_or_else(|| decode_err("MGF1 parameters are missing".to_string()))?;
    let (_, mgf_hash) = Oid::from_ber(mgf_params.data)
        .map_err(|err| decode_err(format!("bad MGF1 hash: {err}")))?;
    if mgf_hash != OID_SHA256 {
        return Err(decode_err(format!("MGF1 hash {mgf_hash} is not SHA-256")));
    }

    Ok(())
}

/// Pulls the IV out of the content-encryption algorithm parameters.
fn content_iv(algorithm: &RawAlgorithm<'_>) -> Result<Vec<u8>, Error> {
    let params = algorithm
        .params
        .as_ref()
        .ok_or_else(|| decode_err("AES-CBC IV parameter is missing".to_string()))?;

    let iv: OctetString = params
        .try_into()
        .map_err(|err: asn1_rs::Error| decode_err(format!("AES-CBC IV is malformed: {err}")))?;

    if iv.as_ref().len() != AES_IV_LEN {
        return Err(decode_err(format!(
            "AES-CBC IV is {} bytes, expected {AES_IV_LEN}",
            iv.as_ref().len()
        )));
    }

    Ok(iv.as_ref().to_vec())
}

/// Extracts the `[0] IMPLICIT` encrypted content, reassembling constructed
/// BER octet strings when the encoder chunked them.
fn gather_content(content: &Any<'_>) -> Result<Vec<u8>, Error> {
    if content.header.class() != Class::ContextSpecific || content.header.tag().0 != 0 {
        return Err(decode_err(format!(
            "encrypted content has class {:?} tag {}, expected [0]",
            content.header.class(),
            content.header.tag().0
        )));
    }

    if !content.header.is_constructed() {
        return Ok(content.data.to_vec());
    }

    let mut combined = Vec::new();
    let mut rest = content.data;
    while !rest.is_empty() {
        let (next, chunk) = OctetString::from_ber(rest)
            .map_err(|err| decode_err(format!("bad encrypted content chunk: {err}")))?;
        combined.extend_from_slice(chunk.as_ref());
        rest = next;
    }

    Ok(combined)
}

#[cfg(test)]
pub(crate) mod tests {
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::{BlockEncryptMut, KeyIvInit};
    use rand::RngCore;
    use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
    use sha2::Sha256;

    use caisson_common::Error;

    use super::RecipientEnvelope;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    // Minimal DER emitter, enough to build well-formed envelopes for tests.
    // OID content bytes are spelled out rather than derived.

    const DER_OID_ENVELOPED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x03];
    const DER_OID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
    const DER_OID_RSAES_OAEP: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x07];
    const DER_OID_MGF1: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x08];
    const DER_OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
    const DER_OID_AES256_CBC: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x01, 0x2a];

    fn der_len(len: usize) -> Vec<u8> {
        if len < 0x80 {
            return vec![len as u8];
        }
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let mut out = vec![0x80 | (bytes.len() - skip) as u8];
        out.extend_from_slice(&bytes[skip..]);
        out
    }

    fn der(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(der_len(content.len()));
        out.extend_from_slice(content);
        out
    }

    fn der_seq(parts: &[Vec<u8>]) -> Vec<u8> {
        der(0x30, &parts.concat())
    }

    fn der_set(parts: &[Vec<u8>]) -> Vec<u8> {
        der(0x31, &parts.concat())
    }

    fn der_oid(content: &[u8]) -> Vec<u8> {
        der(0x06, content)
    }

    fn der_int(value: u8) -> Vec<u8> {
        der(0x02, &[value])
    }

    fn der_octet(content: &[u8]) -> Vec<u8> {
        der(0x04, content)
    }

    fn der_null() -> Vec<u8> {
        vec![0x05, 0x00]
    }

    fn alg_sha256() -> Vec<u8> {
        der_seq(&[der_oid(DER_OID_SHA256), der_null()])
    }

    fn alg_mgf1_sha256() -> Vec<u8> {
        der_seq(&[der_oid(DER_OID_MGF1), alg_sha256()])
    }

    fn oaep_params() -> Vec<u8> {
        der_seq(&[der(0xA0, &alg_sha256()), der(0xA1, &alg_mgf1_sha256())])
    }

    pub(crate) struct EnvelopeSpec {
        version: u8,
        recipient_count: usize,
        content_oid: &'static [u8],
    }

    impl Default for EnvelopeSpec {
        fn default() -> Self {
            Self {
                version: 2,
                recipient_count: 1,
                content_oid: DER_OID_DATA,
            }
        }
    }

    /// Builds enveloped-data DER wrapping `payload` under a fresh content key
    /// encrypted to `recipient`.
    pub(crate) fn encode_envelope(
        recipient: &RsaPublicKey,
        content_key: &[u8; 32],
        iv: &[u8; 16],
        payload: &[u8],
        spec: &EnvelopeSpec,
    ) -> Vec<u8> {
        let mut rng = rand::thread_rng();

        let wrapped_key = recipient
            .encrypt(&mut rng, Oaep::new::<Sha256>(), content_key)
            .unwrap();

        let ciphertext = Aes256CbcEnc::new(content_key.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(payload);

        let recipient_info = der_seq(&[
            der_int(2),
            // rid: [0] IMPLICIT subjectKeyIdentifier
            der(0x80, b"recipient-key-id"),
            der_seq(&[der_oid(DER_OID_RSAES_OAEP), oaep_params()]),
            der_octet(&wrapped_key),
        ]);

        let recipients: Vec<Vec<u8>> = (0..spec.recipient_count)
            .map(|_| recipient_info.clone())
            .collect();

        let encrypted_content = der_seq(&[
            der_oid(spec.content_oid),
            der_seq(&[der_oid(DER_OID_AES256_CBC), der_octet(iv)]),
            // [0] IMPLICIT, primitive
            der(0x80, &ciphertext),
        ]);

        let enveloped = der_seq(&[
            der_int(spec.version),
            der_set(&recipients),
            encrypted_content,
        ]);

        der_seq(&[der_oid(DER_OID_ENVELOPED_DATA), der(0xA0, &enveloped)])
    }

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
    }

    fn random_material() -> ([u8; 32], [u8; 16]) {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        (key, iv)
    }

    #[test]
    fn round_trips_payloads_of_various_sizes() {
        let private = test_key();
        let public = RsaPublicKey::from(&private);

        for size in [0usize, 1, 15, 16, 64, 1024, 4096 + 3] {
            let mut payload = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut payload);

            let (key, iv) = random_material();
            let ber = encode_envelope(&public, &key, &iv, &payload, &EnvelopeSpec::default());

            let envelope = RecipientEnvelope::parse(&ber).unwrap();
            let opened = envelope.open(&private).unwrap();
            assert_eq!(opened, payload, "size {size}");
        }
    }

    #[test]
    fn rejects_wrong_structure() {
        let private = test_key();
        let public = RsaPublicKey::from(&private);
        let (key, iv) = random_material();

        // Wrong envelope version.
        let ber = encode_envelope(
            &public,
            &key,
            &iv,
            b"payload",
            &EnvelopeSpec {
                version: 1,
                ..Default::default()
            },
        );
        assert!(matches!(
            RecipientEnvelope::parse(&ber),
            Err(Error::EnvelopeDecode(_))
        ));

        // Two recipients.
        let ber = encode_envelope(
            &public,
            &key,
            &iv,
            b"payload",
            &EnvelopeSpec {
                recipient_count: 2,
                ..Default::default()
            },
        );
        assert!(matches!(
            RecipientEnvelope::parse(&ber),
            Err(Error::EnvelopeDecode(_))
        ));

        // Content that is not id-data.
        let ber = encode_envelope(
            &public,
            &key,
            &iv,
            b"payload",
            &EnvelopeSpec {
                content_oid: DER_OID_ENVELOPED_DATA,
                ..Default::default()
            },
        );
        assert!(matches!(
            RecipientEnvelope::parse(&ber),
            Err(Error::EnvelopeDecode(_))
        ));

        // Not ASN.1 at all.
        assert!(RecipientEnvelope::parse(b"definitely not BER").is_err());
    }

    #[test]
    fn wrong_private_key_fails_closed() {
        let private = test_key();
        let public = RsaPublicKey::from(&private);
        let other = test_key();
        let (key, iv) = random_material();

        let ber = encode_envelope(&public, &key, &iv, b"sealed", &EnvelopeSpec::default());
        let envelope = RecipientEnvelope::parse(&ber).unwrap();

        assert!(matches!(envelope.open(&other), Err(Error::Decrypt)));
        assert_eq!(envelope.open(&private).unwrap(), b"sealed");
    }
}
