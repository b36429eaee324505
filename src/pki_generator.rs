//! Certificate construction with the `openssl` crate
//!
//! Two jobs live here:
//! - signing a client CSR with the intermediate CA ([`sign_user_request`]),
//!   used by the in-process signing backend;
//! - building a development Root → Intermediate hierarchy on disk
//!   ([`bootstrap_dev_ca`]) in the layout the local backend expects.
//!
//! ```text
//! Root CA (self-signed, pathlen=1)
//!   └── Intermediate CA (signed by Root, pathlen=0)   ← signs client requests
//!       └── Client certificate (CA=false, clientAuth + emailProtection)
//! ```

use anyhow::{anyhow, Context, Result};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509NameRef, X509Ref, X509Req, X509};
use std::fs;
use std::path::{Path, PathBuf};

use crate::work_area::write_secret_file;

const ROOT_CA_PATH_LENGTH: u32 = 1;
const INTERMEDIATE_CA_PATH_LENGTH: u32 = 0;
const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const INITIAL_SERIAL: &str = "1000";

/// Distinguished name and lifetime of a CA certificate
#[derive(Debug, Clone)]
pub struct CaSubject {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub locality: String,
    pub state: String,
    pub country: String,
    pub validity_days: u32,
}

impl CaSubject {
    pub fn development(common_name: &str, validity_days: u32) -> Self {
        Self {
            common_name: common_name.to_string(),
            organization: "Aurora-Teste".to_string(),
            organizational_unit: "Dev".to_string(),
            locality: "Goiania".to_string(),
            state: "GO".to_string(),
            country: "BR".to_string(),
            validity_days,
        }
    }

    fn to_name(&self) -> Result<X509Name> {
        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::COUNTRYNAME, &self.country)
            .map_err(|e| anyhow!("Failed to set country: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::STATEORPROVINCENAME, &self.state)
            .map_err(|e| anyhow!("Failed to set state/province: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::LOCALITYNAME, &self.locality)
            .map_err(|e| anyhow!("Failed to set locality: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::ORGANIZATIONNAME, &self.organization)
            .map_err(|e| anyhow!("Failed to set organization: {}", e))?;
        name_builder
            .append_entry_by_nid(
                openssl::nid::Nid::ORGANIZATIONALUNITNAME,
                &self.organizational_unit,
            )
            .map_err(|e| anyhow!("Failed to set organizational unit: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::COMMONNAME, &self.common_name)
            .map_err(|e| anyhow!("Failed to set CN: {}", e))?;
        Ok(name_builder.build())
    }
}

fn generate_rsa_key(key_bits: u32) -> Result<PKey<Private>> {
    let rsa = openssl::rsa::Rsa::generate(key_bits)
        .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
    PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))
}

fn random_serial() -> Result<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(128, openssl::bn::MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

/// Generate a self-signed Root CA
pub fn generate_root_ca(subject: &CaSubject, key_bits: u32) -> Result<(PKey<Private>, X509)> {
    let private_key = generate_rsa_key(key_bits)?;
    let name = subject.to_name()?;
    let certificate = build_ca_certificate(
        subject,
        &name,
        &name,
        &private_key,
        &private_key,
        None,
        ROOT_CA_PATH_LENGTH,
    )?;
    Ok((private_key, certificate))
}

/// Generate an Intermediate CA signed by `root_key`
pub fn generate_intermediate_ca(
    subject: &CaSubject,
    key_bits: u32,
    root_key: &PKey<Private>,
    root_cert: &X509,
) -> Result<(PKey<Private>, X509)> {
    let private_key = generate_rsa_key(key_bits)?;
    let name = subject.to_name()?;
    let issuer: &X509Ref = root_cert;
    let certificate = build_ca_certificate(
        subject,
        &name,
        root_cert.subject_name(),
        &private_key,
        root_key,
        Some(issuer),
        INTERMEDIATE_CA_PATH_LENGTH,
    )?;
    Ok((private_key, certificate))
}

fn build_ca_certificate(
    subject: &CaSubject,
    subject_name: &X509NameRef,
    issuer_name: &X509NameRef,
    subject_key: &PKey<Private>,
    signing_key: &PKey<Private>,
    issuer_cert: Option<&X509Ref>,
    path_length: u32,
) -> Result<X509> {
    let mut builder =
        X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;
    builder
        .set_version(X509_VERSION_3)
        .map_err(|e| anyhow!("Failed to set version: {}", e))?;
    let serial: Asn1Integer = random_serial()?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder
        .set_subject_name(subject_name)
        .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
    builder
        .set_issuer_name(issuer_name)
        .map_err(|e| anyhow!("Failed to set issuer: {}", e))?;

    let not_before = Asn1Time::days_from_now(0)
        .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
    builder
        .set_not_before(&not_before)
        .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
    let not_after = Asn1Time::days_from_now(subject.validity_days)
        .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
    builder
        .set_not_after(&not_after)
        .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

    builder
        .set_pubkey(subject_key)
        .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

    let bc = BasicConstraints::new()
        .critical()
        .ca()
        .pathlen(path_length)
        .build()
        .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
    builder
        .append_extension(bc)
        .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

    let ku = KeyUsage::new()
        .critical()
        .key_cert_sign()
        .crl_sign()
        .digital_signature()
        .build()
        .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
    builder
        .append_extension(ku)
        .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(issuer_cert, None))
        .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
    builder
        .append_extension(ski)
        .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

    if let Some(issuer_cert) = issuer_cert {
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(issuer_cert), None))
            .map_err(|e| anyhow!("Failed to build AuthorityKeyIdentifier: {}", e))?;
        builder
            .append_extension(aki)
            .map_err(|e| anyhow!("Failed to add AuthorityKeyIdentifier: {}", e))?;
    }

    builder
        .sign(signing_key, MessageDigest::sha256())
        .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;
    Ok(builder.build())
}

/// Sign a client CSR with the intermediate CA
///
/// The subject and public key are copied from the CSR; requested extensions
/// are ignored and replaced by the client-certificate profile.
pub fn sign_user_request(
    csr: &X509Req,
    ca_key: &PKey<Private>,
    ca_cert: &X509Ref,
    serial: &BigNum,
    not_after: &Asn1Time,
) -> Result<X509> {
    let request_key = csr
        .public_key()
        .map_err(|e| anyhow!("Failed to read CSR public key: {}", e))?;
    if !csr
        .verify(&request_key)
        .map_err(|e| anyhow!("Failed to verify CSR signature: {}", e))?
    {
        return Err(anyhow!("CSR signature does not match its public key"));
    }

    let mut builder =
        X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;
    builder
        .set_version(X509_VERSION_3)
        .map_err(|e| anyhow!("Failed to set version: {}", e))?;
    let serial_number: Asn1Integer = serial.to_asn1_integer()?;
    builder
        .set_serial_number(&serial_number)
        .map_err(|e| anyhow!("Failed to set serial number: {}", e))?;
    builder
        .set_subject_name(csr.subject_name())
        .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
    builder
        .set_issuer_name(ca_cert.subject_name())
        .map_err(|e| anyhow!("Failed to set issuer from intermediate CA: {}", e))?;

    let not_before = Asn1Time::days_from_now(0)
        .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
    builder
        .set_not_before(&not_before)
        .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
    builder
        .set_not_after(not_after)
        .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;
    builder
        .set_pubkey(&request_key)
        .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

    // End-entity certificate: CA=false
    let bc = BasicConstraints::new()
        .critical()
        .build()
        .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
    builder
        .append_extension(bc)
        .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

    let ku = KeyUsage::new()
        .critical()
        .digital_signature()
        .non_repudiation()
        .key_encipherment()
        .build()
        .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
    builder
        .append_extension(ku)
        .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

    let eku = ExtendedKeyUsage::new()
        .client_auth()
        .email_protection()
        .build()
        .map_err(|e| anyhow!("Failed to build ExtendedKeyUsage: {}", e))?;
    builder
        .append_extension(eku)
        .map_err(|e| anyhow!("Failed to add ExtendedKeyUsage: {}", e))?;

    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(Some(ca_cert), None))
        .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
    builder
        .append_extension(ski)
        .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(ca_cert), None))
        .map_err(|e| anyhow!("Failed to build AuthorityKeyIdentifier: {}", e))?;
    builder
        .append_extension(aki)
        .map_err(|e| anyhow!("Failed to add AuthorityKeyIdentifier: {}", e))?;

    builder
        .sign(ca_key, MessageDigest::sha256())
        .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;
    Ok(builder.build())
}

/// Files written by [`bootstrap_dev_ca`]
#[derive(Debug, Clone)]
pub struct DevCaPaths {
    /// CA descriptor for the local signing backend
    pub descriptor: PathBuf,
    /// Intermediate followed by root, PEM
    pub chain: PathBuf,
    pub root_cert: PathBuf,
    pub ca_cert: PathBuf,
}

/// Write a development Root + Intermediate CA into `dir`
///
/// Layout: `root.crt`, `ca.key`, `ca.crt`, `chain.pem`, `serial`,
/// `index.txt` and the `ca.toml` descriptor. The root key is not kept.
pub fn bootstrap_dev_ca(dir: &Path, key_bits: u32) -> Result<DevCaPaths> {
    fs::create_dir_all(dir)
        .context(format!("Failed to create CA directory {}", dir.display()))?;
    let descriptor = dir.join("ca.toml");
    if descriptor.exists() {
        return Err(anyhow!(
            "A CA descriptor already exists at {}",
            descriptor.display()
        ));
    }

    let (root_key, root_cert) =
        generate_root_ca(&CaSubject::development("Aurora-Teste Root CA", 3650), key_bits)
            .context("Failed to generate Root CA")?;
    let (ca_key, ca_cert) = generate_intermediate_ca(
        &CaSubject::development("Aurora-Teste Issuing CA", 1825),
        key_bits,
        &root_key,
        &root_cert,
    )
    .context("Failed to generate Intermediate CA")?;

    let root_pem = root_cert.to_pem()?;
    let ca_pem = ca_cert.to_pem()?;
    let mut chain_pem = ca_pem.clone();
    chain_pem.extend_from_slice(&root_pem);

    let paths = DevCaPaths {
        descriptor,
        chain: dir.join("chain.pem"),
        root_cert: dir.join("root.crt"),
        ca_cert: dir.join("ca.crt"),
    };

    write_secret_file(&dir.join("ca.key"), &ca_key.private_key_to_pem_pkcs8()?)
        .context("Failed to write CA private key")?;
    fs::write(&paths.ca_cert, &ca_pem)?;
    fs::write(&paths.root_cert, &root_pem)?;
    fs::write(&paths.chain, &chain_pem)?;
    fs::write(dir.join("serial"), format!("{}\n", INITIAL_SERIAL))?;
    fs::write(dir.join("index.txt"), b"")?;
    fs::write(
        &paths.descriptor,
        "key_path = \"ca.key\"\n\
         cert_path = \"ca.crt\"\n\
         serial_path = \"serial\"\n\
         index_path = \"index.txt\"\n",
    )?;

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::X509StoreContext;

    fn client_csr(common_name: &str) -> (PKey<Private>, X509Req) {
        let key = generate_rsa_key(2048).unwrap();
        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, common_name)
            .unwrap();
        let mut req = X509Req::builder().unwrap();
        req.set_subject_name(&name.build()).unwrap();
        req.set_pubkey(&key).unwrap();
        req.sign(&key, MessageDigest::sha256()).unwrap();
        (key, req.build())
    }

    #[test]
    fn test_bootstrap_writes_verifiable_chain() {
        let dir = tempfile::tempdir().unwrap();
        let paths = bootstrap_dev_ca(dir.path(), 2048).unwrap();

        let chain = X509::stack_from_pem(&fs::read(&paths.chain).unwrap()).unwrap();
        assert_eq!(chain.len(), 2);
        let root = &chain[1];
        let intermediate = &chain[0];
        assert!(intermediate.verify(&root.public_key().unwrap()).unwrap());
        assert_eq!(fs::read_to_string(dir.path().join("serial")).unwrap().trim(), "1000");
        assert!(bootstrap_dev_ca(dir.path(), 2048).is_err());
    }

    #[test]
    fn test_signed_client_certificate_chains_to_root() {
        let (root_key, root_cert) =
            generate_root_ca(&CaSubject::development("Root", 30), 2048).unwrap();
        let (ca_key, ca_cert) = generate_intermediate_ca(
            &CaSubject::development("Issuing", 30),
            2048,
            &root_key,
            &root_cert,
        )
        .unwrap();
        let (client_key, csr) = client_csr("Maria Silva");

        let serial = BigNum::from_u32(0x1000).unwrap();
        let not_after = Asn1Time::days_from_now(1).unwrap();
        let cert = sign_user_request(&csr, &ca_key, &ca_cert, &serial, &not_after).unwrap();

        assert!(cert.public_key().unwrap().public_eq(&client_key));
        assert_eq!(
            cert.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string(),
            "1000"
        );

        let mut store = X509StoreBuilder::new().unwrap();
        store.add_cert(root_cert).unwrap();
        let store = store.build();
        let mut untrusted = Stack::new().unwrap();
        untrusted.push(ca_cert).unwrap();
        let mut ctx = X509StoreContext::new().unwrap();
        let verified = ctx
            .init(&store, &cert, &untrusted, |c| c.verify_cert())
            .unwrap();
        assert!(verified);
    }

    #[test]
    fn test_tampered_csr_is_rejected() {
        let (ca_key, ca_cert) =
            generate_root_ca(&CaSubject::development("Root", 30), 2048).unwrap();
        let (_, csr) = client_csr("Mallory");
        let (other_key, _) = client_csr("Other");

        // Re-key the CSR without re-signing it
        let mut forged = X509Req::builder().unwrap();
        forged.set_subject_name(csr.subject_name()).unwrap();
        forged.set_pubkey(&other_key).unwrap();
        let (third_key, _) = client_csr("Third");
        forged.sign(&third_key, MessageDigest::sha256()).unwrap();
        let forged = forged.build();

        let serial = BigNum::from_u32(1).unwrap();
        let not_after = Asn1Time::days_from_now(1).unwrap();
        assert!(sign_user_request(&forged, &ca_key, &ca_cert, &serial, &not_after).is_err());
    }
}
