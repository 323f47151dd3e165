//! Prompt templates for every model call.

use serde_json::Value;

use crate::fhir::tool::{FetchRecordsTool, TOOL_NAME};
use crate::models::{DoctorQuery, RawRecordBundle, TranslatedQuery};

/// Literal used as evidence context when the literature search comes back empty.
pub const NO_EVIDENCE_PLACEHOLDER: &str = "No relevant articles found.";

pub const ASSISTANT_PREAMBLE: &str = "You are MedQuery, a precise, empathetic and highly knowledgeable AI medical assistant supporting healthcare professionals with evidence-based, clear and concise answers.";

pub const TRANSLATOR_PREAMBLE: &str = "You are a precise and efficient assistant that translates natural-language medical queries into FHIR-compliant API queries. Your output is a single JSON object and nothing else.";

pub const RETRIEVER_PREAMBLE: &str = "You are a medical assistant specializing in retrieving data from FHIR servers. Your task is to fetch the required resources based on the provided FHIR query parameters, using only the tool you are given.";

pub const FORMATTER_PREAMBLE: &str = "You are a medical assistant specializing in summarizing patient data retrieved from FHIR servers. Your task is to convert raw FHIR data into a concise, human-readable format, preserving key details.";

pub fn general_qa_prompt(doctor_query: &str, context: &str) -> String {
    format!(
        r#"# Environment
You are assisting a doctor in a clinical setting who works under time constraints and needs precise, actionable insight.
Doctor's question: {doctor_query}

# Context
The following articles were retrieved from PubMed to support your response:
{context}

Use this context as a knowledge base. Weave it into the answer and cite the source (PMID, title, Published) wherever you rely on it.

# Goal
1. Identify the core intent and medical focus of the question.
2. Deliver a structured, evidence-based answer, including relevant guidelines and references.
3. Mention current best practice or emerging treatments where applicable.
4. Offer clear reasoning or alternatives that support the clinical decision.
5. For patient scenarios, suggest next-step evaluations, diagnostic tests, imaging or referrals.

# Guardrails
- Avoid speculative advice; prefer clinically validated information.
- Do not give a definitive diagnosis; augment the doctor's expertise.
- Do not introduce irrelevant information or unsupported sources.

# Output
- Use bold text for the title (e.g. **Query Response**), not a markdown header.
- Start with key considerations or differentials as bullet points.
- Cover diagnostic workup, current management recommendations and 1-2 follow-up considerations.
- If appropriate, close with: "Does this address your query, or would you like further elaboration?""#
    )
}

pub fn patient_qa_prompt(doctor_query: &str, translated: &TranslatedQuery, formatted_fhir_data: &str) -> String {
    format!(
        r#"**Context**
- Doctor's Query: "{doctor_query}"
- FHIR Query: "{fhir_query}"
- Metadata:
    - Intent: {intent}
    - Entities: {entities}
    - Ambiguities: {ambiguities}
- Patient Data (from FHIR):
{formatted_fhir_data}

Use this context to tailor your response to the patient's specific medical scenario.

**Goal**
1. Address the core question directly and clearly.
2. Use the patient data to give actionable, evidence-based recommendations.
3. Suggest practical next steps in diagnosis, treatment or follow-up care.
4. Briefly highlight relevant guidelines, studies or emerging treatments.

**Guidelines**
- Be concise; use bullet points or structured responses.
- Integrate patient data meaningfully without restating unnecessary details.
- If the patient data is missing or incomplete, say so explicitly.
- Avoid speculative advice or overly complex language.

**Output Format**
- **Response Title** in bold (e.g. **Query Response**).
- **Patient-Relevant Insights**: summary of the FHIR data and the critical considerations it raises.
- **Actionable Steps**: diagnostics, treatment options, referrals, monitoring.
- **Closing**: "Does this address your query, or would you like further elaboration?""#,
        fhir_query = translated.fhir_query,
        intent = translated.intent,
        entities = translated.entities_json(),
        ambiguities = translated.ambiguities_json(),
    )
}

pub fn translator_prompt(patient_id: &str, query: &DoctorQuery) -> String {
    let schema = serde_json::to_string_pretty(&TranslatedQuery::schema()).unwrap_or_default();
    format!(
        r#"- Doctor's query: "{content}"
- Metadata:
    - Patient ID: {patient_id}
    - Query Date: {created_at}

Work through the question as follows:
1. **Intent**: the primary goal (retrieve patient data, analyze observations, list medications, ...).
2. **Entities**: resource type (Observation, Encounter, MedicationRequest, ...) and relevant parameters (dates, codes, statuses).
3. **Ambiguities**: missing or unclear details (time frame, which measurement, ...).

Then translate the question into FHIR search parameters. Always produce a valid query, even when ambiguities remain; record them instead of refusing.

Filter syntax examples:
- equality: patient={patient_id}
- ranges with comparison prefixes (eq, ne, gt, lt, ge, le): birthdate=gt1944&birthdate=lt1964, authoredon=ge2025-02-07
- text-matching modifiers: name:contains=John, family:exact=Moore, gender:not=male
- several values for one key (any of): status=active,completed
- chained references: general-practitioner:Organization.name=Hospital
- sort, descending with '-': _sort=-_lastUpdated

Example: patient=564b051c-6fcf-4123-909e-5ee74d5f6a9a&authoredon=ge2025-02-07&status=active,completed

Respond **only** with a JSON object matching this schema. `fhir_query` holds only the query parameters, without server URL or leading '?':
{schema}"#,
        content = query.content,
        created_at = query.created_at.to_rfc3339(),
    )
}

pub fn translator_repair_prompt(error: &str) -> String {
    format!(
        "Your previous answer could not be used: {error}\nRespond again with only the corrected JSON object."
    )
}

pub fn retriever_prompt(translated: &TranslatedQuery) -> String {
    let tool = serde_json::to_string_pretty(&FetchRecordsTool::definition()).unwrap_or_default();
    format!(
        r#"# Input
- FHIR Query: "{fhir_query}"
- Metadata:
    - Intent: {intent}
    - Entities: {entities}
    - Ambiguities: {ambiguities}

# Tool
You can call exactly one tool:
{tool}

# Search parameter examples
{{"resource_type": "Patient", "search_params": {{"birthdate__gt": "1944", "birthdate__lt": "1964"}}}}  ->  /Patient?birthdate=gt1944&birthdate=lt1964
{{"search_params": {{"name__contains": "John"}}}}  ->  name:contains=John
{{"search_params": {{"name": ["John", "Rivera"]}}}}  ->  name=John&name=Rivera
{{"search_params": {{"name": "John,Eva"}}}}  ->  name=John,Eva
{{"search_params": {{"family__exact": "Moore"}}}}  ->  family:exact=Moore
{{"search_params": {{"address_state": "TX"}}}}  ->  address-state=TX
{{"search_params": {{"active": true, "_id": "id"}}}}  ->  active=true&_id=id
{{"search_params": {{"gender__not": ["male", "female"]}}}}  ->  gender:not=male&gender:not=female
{{"search_params": {{"general_practitioner__Organization__name": "Hospital"}}}}  ->  general-practitioner:Organization.name=Hospital
{{"search_params": {{"general_practitioner__name": "Hospital"}}}}  ->  general-practitioner.name=Hospital

# Protocol
Reply with exactly one JSON object per turn, choosing one action:
- {{"action": "{TOOL_NAME}", "resource_type": "...", "search_params": {{...}}, "limit": 10, "sort": "-_lastUpdated", "require_count": false}}
- {{"action": "noop"}} when you need another turn without fetching
- {{"action": "finish", "result": <JSON of the FHIR resources you retrieved>}}

Each tool call is answered with TOOL_RESULT or TOOL_ERROR. On TOOL_ERROR, adjust the parameters (e.g. narrower or different filters) and try again.
Translate the FHIR query above into tool calls, then finish with the retrieved resources."#,
        fhir_query = translated.fhir_query,
        intent = translated.intent,
        entities = translated.entities_json(),
        ambiguities = translated.ambiguities_json(),
    )
}

pub fn tool_result_message(output: &Value) -> String {
    format!("TOOL_RESULT {}", output)
}

pub fn tool_error_message(error: &str) -> String {
    format!("TOOL_ERROR {}", error)
}

pub fn formatter_prompt(translated: &TranslatedQuery, bundle: &RawRecordBundle) -> String {
    format!(
        r#"# Input
{records}

# Context
- FHIR Query: "{fhir_query}"
- Metadata:
    - Intent: {intent}
    - Entities: {entities}
    - Ambiguities: {ambiguities}

Instructions:
- Extract and summarize the details of the retrieved FHIR data most relevant to the doctor's query.
- Keep it concise but include essential details such as encounter dates, types, locations, clinicians and other critical metadata.
- Handle missing or incomplete data gracefully and state clearly any limitations or gaps in the retrieved data.
- Do not invent data that is not present above.

Output Format:
- A natural-language summary of the FHIR data in paragraph or bullet-point form."#,
        records = bundle.render(),
        fhir_query = translated.fhir_query,
        intent = translated.intent,
        entities = translated.entities_json(),
        ambiguities = translated.ambiguities_json(),
    )
}

/// Summary used when the retriever found nothing; no model call is made.
pub fn empty_bundle_summary(translated: &TranslatedQuery) -> String {
    let mut summary = format!(
        "No records were retrieved from the FHIR server for the query \"{}\" (intent: {}). The patient's record may not contain matching data, so nothing can be reported for this question.",
        translated.fhir_query, translated.intent
    );
    if !translated.ambiguities().is_empty() {
        summary.push_str(" Unresolved ambiguities: ");
        summary.push_str(&translated.ambiguities().join("; "));
    }
    summary
}
